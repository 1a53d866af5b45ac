//! NAT datapath runner: the queue-facing execution loop.
//!
//! Packets arrive from the kernel packet queue tagged with their ingress
//! interface index. The runner maps the index to a LAN or WAN role,
//! dispatches to the translator, and returns the verdict to the queue.
//! Translation is fully synchronous: one packet is processed to
//! completion before the next is read.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use super::{Translator, Verdict};
use crate::types::InterfaceRole;

/// Netfilter queue number the datapath attaches to.
pub const QUEUE_NUM: u16 = 42;

/// How often idle mappings are swept between queue reads.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Datapath counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerStats {
    pub outbound_mangled: u64,
    pub inbound_mangled: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub unknown_ingress: u64,
}

/// Owns a translator and drives it from the packet queue.
pub struct NatRunner {
    translator: Box<dyn Translator + Send>,
    roles: HashMap<u32, InterfaceRole>,
    stats: RunnerStats,
    last_sweep: Instant,
}

impl NatRunner {
    /// `roles` maps ingress interface indexes to their datapath role.
    pub fn new(
        translator: Box<dyn Translator + Send>,
        roles: HashMap<u32, InterfaceRole>,
    ) -> Self {
        Self {
            translator,
            roles,
            stats: RunnerStats::default(),
            last_sweep: Instant::now(),
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
    }

    /// Process one packet: dispatch by ingress role, return the verdict.
    ///
    /// Packets from interfaces with no configured role are dropped; the
    /// queue should only be fed from the two NAT legs.
    pub fn process(&mut self, ingress: u32, packet: &mut [u8]) -> Verdict {
        let verdict = match self.roles.get(&ingress) {
            Some(InterfaceRole::Lan) => self.translator.translate_outbound(packet),
            Some(InterfaceRole::Wan) => self.translator.translate_inbound(packet),
            None => {
                self.stats.unknown_ingress += 1;
                trace!(ingress, "packet from unconfigured interface");
                return Verdict::Drop;
            }
        };

        match (verdict, self.roles[&ingress]) {
            (Verdict::Mangle, InterfaceRole::Lan) => self.stats.outbound_mangled += 1,
            (Verdict::Mangle, InterfaceRole::Wan) => self.stats.inbound_mangled += 1,
            (Verdict::Accept, _) => self.stats.accepted += 1,
            (Verdict::Drop, _) => self.stats.dropped += 1,
        }
        verdict
    }

    /// Sweep idle table state if the interval has elapsed.
    pub fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
            self.translator.sweep();
            self.last_sweep = Instant::now();
        }
    }

    /// Attach to the kernel packet queue and run until the queue errors.
    #[cfg(target_os = "linux")]
    pub fn run(&mut self) -> crate::error::Result<()> {
        use crate::error::Error;
        use tracing::info;

        let mut queue = nfq::Queue::open()
            .map_err(|e| Error::QueueUnavailable(format!("opening netfilter queue: {e}")))?;
        queue
            .bind(QUEUE_NUM)
            .map_err(|e| Error::QueueUnavailable(format!("binding queue {QUEUE_NUM}: {e}")))?;

        info!(queue = QUEUE_NUM, "attached to packet queue");

        loop {
            let mut msg = queue.recv()?;
            let ingress = msg.get_indev();
            let mut payload = msg.get_payload().to_vec();

            match self.process(ingress, &mut payload) {
                Verdict::Accept => msg.set_verdict(nfq::Verdict::Accept),
                Verdict::Drop => msg.set_verdict(nfq::Verdict::Drop),
                Verdict::Mangle => {
                    msg.set_payload(payload);
                    msg.set_verdict(nfq::Verdict::Accept);
                }
            }
            queue.verdict(msg)?;
            self.maybe_sweep();
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn run(&mut self) -> crate::error::Result<()> {
        Err(crate::error::Error::QueueUnavailable(
            "the NAT datapath requires a Linux netfilter queue".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records which translation path each packet took.
    struct CountingTranslator {
        outbound: usize,
        inbound: usize,
    }

    impl Translator for CountingTranslator {
        fn translate_outbound(&mut self, _packet: &mut [u8]) -> Verdict {
            self.outbound += 1;
            Verdict::Mangle
        }

        fn translate_inbound(&mut self, _packet: &mut [u8]) -> Verdict {
            self.inbound += 1;
            Verdict::Drop
        }
    }

    #[test]
    fn dispatches_by_ingress_role() {
        let roles = HashMap::from([(2, InterfaceRole::Lan), (3, InterfaceRole::Wan)]);
        let mut runner = NatRunner::new(
            Box::new(CountingTranslator {
                outbound: 0,
                inbound: 0,
            }),
            roles,
        );

        let mut buf = vec![0u8; 64];
        assert_eq!(runner.process(2, &mut buf), Verdict::Mangle);
        assert_eq!(runner.process(3, &mut buf), Verdict::Drop);
        assert_eq!(runner.process(3, &mut buf), Verdict::Drop);

        let stats = runner.stats();
        assert_eq!(stats.outbound_mangled, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn unknown_ingress_drops_without_translation() {
        let mut runner = NatRunner::new(
            Box::new(CountingTranslator {
                outbound: 0,
                inbound: 0,
            }),
            HashMap::new(),
        );

        let mut buf = vec![0u8; 64];
        assert_eq!(runner.process(9, &mut buf), Verdict::Drop);
        assert_eq!(runner.stats().unknown_ingress, 1);
        assert_eq!(runner.stats().dropped, 0);
    }
}
