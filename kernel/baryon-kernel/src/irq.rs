//! Hardware interrupt chains, bottom halves and the trap table.
//!
//! Each of the 16 IRQ lines carries a chain of registered actions; the
//! dispatcher masks the line, acknowledges the PIC, bumps the line's
//! tick counter and runs the chain in registration order. A line with
//! no chain is spurious: each occurrence is logged until a cap, then
//! silenced. Work that must not run with interrupts disabled is put in
//! a bottom half, flagged active from the handler and run once after
//! IRQ return with interrupts enabled.
//!
//! Registration order is the execution order; removal is supported for
//! the chain tail only (the stated driver-teardown limitation).

use baryon_core::{Errno, Result};

use crate::signal::SigContext;

/// Hardware interrupt lines.
pub const NR_IRQS: usize = 16;

/// Actions chained per line.
const NR_ACTIONS: usize = 4;

/// Bottom-half slots.
const NR_BH: usize = 8;

/// Spurious reports logged per line before going quiet.
const SPURIOUS_LOG_CAP: u32 = 5;

/// An interrupt handler: receives the line number and the interrupted
/// context. Must not sleep.
pub type IrqHandler = fn(irq: usize, sc: &SigContext);

/// A bottom-half body, run with interrupts enabled after IRQ return.
pub type BhFn = fn();

/// One registered handler on a line's chain.
#[derive(Clone, Copy)]
struct IrqAction {
    name: &'static str,
    handler: IrqHandler,
}

/// One line's chain and counters.
struct IrqLine {
    actions: [Option<IrqAction>; NR_ACTIONS],
    /// Interrupts taken on this line.
    ticks: u32,
    spurious: u32,
}

impl IrqLine {
    const fn new() -> Self {
        Self {
            actions: [None; NR_ACTIONS],
            ticks: 0,
            spurious: 0,
        }
    }

    fn chain_len(&self) -> usize {
        self.actions.iter().take_while(|a| a.is_some()).count()
    }
}

/// A bottom-half record.
#[derive(Clone, Copy)]
struct Bh {
    fn_: BhFn,
    active: bool,
}

/// What the hardware layer must do around dispatch; the 8259 driver on
/// the target, a recorder in tests.
pub trait IrqController {
    /// Masks the line at the PIC.
    fn mask(&mut self, irq: usize);
    /// Unmasks the line.
    fn unmask(&mut self, irq: usize);
    /// Sends the end-of-interrupt acknowledgment.
    fn ack(&mut self, irq: usize);
}

/// The interrupt dispatch table.
pub struct IrqTable {
    lines: [IrqLine; NR_IRQS],
    bhs: [Option<Bh>; NR_BH],
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lines: [const { IrqLine::new() }; NR_IRQS],
            bhs: [None; NR_BH],
        }
    }

    /// Appends a handler to a line's chain.
    ///
    /// Fails with `EINVAL` for a bad line or a duplicate registration,
    /// `ENOMEM` when the chain is full.
    pub fn register_irq(
        &mut self,
        irq: usize,
        name: &'static str,
        handler: IrqHandler,
    ) -> Result<()> {
        if irq >= NR_IRQS {
            return Err(Errno::EINVAL);
        }
        let line = &mut self.lines[irq];
        if line
            .actions
            .iter()
            .flatten()
            .any(|a| core::ptr::fn_addr_eq(a.handler, handler))
        {
            baryon_core::kwarn!("irq {irq}: handler already registered");
            return Err(Errno::EINVAL);
        }
        let len = line.chain_len();
        if len == NR_ACTIONS {
            return Err(Errno::ENOMEM);
        }
        line.actions[len] = Some(IrqAction { name, handler });
        line.ticks = 0;
        Ok(())
    }

    /// Removes a handler — only the tail of the chain may go.
    pub fn unregister_irq(&mut self, irq: usize, handler: IrqHandler) -> Result<()> {
        if irq >= NR_IRQS {
            return Err(Errno::EINVAL);
        }
        let line = &mut self.lines[irq];
        let len = line.chain_len();
        for i in 0..len {
            let a = line.actions[i].as_ref().unwrap();
            if core::ptr::fn_addr_eq(a.handler, handler) {
                if i != len - 1 {
                    baryon_core::kwarn!("irq {irq}: cannot unregister a non-tail handler");
                    return Err(Errno::EINVAL);
                }
                line.actions[i] = None;
                return Ok(());
            }
        }
        Ok(())
    }

    /// The names registered on a line, chain order.
    #[must_use]
    pub fn chain_names(&self, irq: usize) -> [Option<&'static str>; NR_ACTIONS] {
        let mut out = [None; NR_ACTIONS];
        for (o, a) in out.iter_mut().zip(self.lines[irq].actions.iter()) {
            *o = a.as_ref().map(|a| a.name);
        }
        out
    }

    /// Interrupts taken on a line.
    #[must_use]
    pub fn ticks(&self, irq: usize) -> u32 {
        self.lines[irq].ticks
    }

    /// Dispatches one hardware interrupt.
    ///
    /// Runs with interrupts disabled: masks the line, ACKs, walks the
    /// chain, unmasks. An empty chain is a spurious interrupt.
    pub fn dispatch(&mut self, pic: &mut dyn IrqController, irq: usize, sc: &SigContext) {
        if irq >= NR_IRQS {
            return;
        }
        pic.mask(irq);

        if self.lines[irq].chain_len() == 0 {
            let line = &mut self.lines[irq];
            line.spurious += 1;
            if line.spurious <= SPURIOUS_LOG_CAP {
                baryon_core::kwarn!("spurious interrupt on irq {irq}");
            }
            pic.unmask(irq);
            return;
        }

        pic.ack(irq);
        crate::kstat::KSTAT
            .irqs
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        self.lines[irq].ticks += 1;
        for i in 0..NR_ACTIONS {
            let Some(action) = self.lines[irq].actions[i] else {
                break;
            };
            (action.handler)(irq, sc);
        }
        pic.unmask(irq);
    }

    /// Registers a bottom half; its slot index orders execution.
    pub fn register_bh(&mut self, fn_: BhFn) -> Result<usize> {
        for (i, slot) in self.bhs.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Bh { fn_, active: false });
                return Ok(i);
            }
        }
        Err(Errno::ENOMEM)
    }

    /// Flags a bottom half to run after the next IRQ return.
    pub fn mark_bh(&mut self, index: usize) {
        if let Some(bh) = self.bhs.get_mut(index).and_then(|b| b.as_mut()) {
            bh.active = true;
        }
    }

    /// Claims the active bottom halves, clearing their flags, so the
    /// caller can run them without holding the table (a nested IRQ may
    /// need it).
    pub fn take_active(&mut self) -> [Option<BhFn>; NR_BH] {
        let mut out = [None; NR_BH];
        for (o, slot) in out.iter_mut().zip(self.bhs.iter_mut()) {
            if let Some(bh) = slot {
                if bh.active {
                    bh.active = false;
                    *o = Some(bh.fn_);
                }
            }
        }
        out
    }

    /// Runs every active bottom half once, in registration order.
    /// Called after IRQ return with interrupts enabled.
    pub fn do_bh(&mut self) {
        for i in 0..NR_BH {
            let run = match &mut self.bhs[i] {
                Some(bh) if bh.active => {
                    bh.active = false;
                    Some(bh.fn_)
                }
                _ => None,
            };
            if let Some(f) = run {
                f();
            }
        }
    }
}

/// CPU exceptions 0..=31: name and whether the CPU pushes an error
/// code. The page-fault handler (vector 14) feeds the fault
/// classifier; vector 0x80 is the syscall gate, not a trap.
pub const TRAPS: [(&str, bool); 32] = [
    ("divide error", false),
    ("debug", false),
    ("nmi", false),
    ("breakpoint", false),
    ("overflow", false),
    ("bound range", false),
    ("invalid opcode", false),
    ("device not available", false),
    ("double fault", true),
    ("coprocessor segment overrun", false),
    ("invalid TSS", true),
    ("segment not present", true),
    ("stack fault", true),
    ("general protection fault", true),
    ("page fault", true),
    ("reserved", false),
    ("fpu error", false),
    ("alignment check", true),
    ("machine check", false),
    ("simd exception", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
    ("reserved", false),
];

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakePic {
        masks: usize,
        unmasks: usize,
        acks: usize,
    }

    impl IrqController for FakePic {
        fn mask(&mut self, _irq: usize) {
            self.masks += 1;
        }
        fn unmask(&mut self, _irq: usize) {
            self.unmasks += 1;
        }
        fn ack(&mut self, _irq: usize) {
            self.acks += 1;
        }
    }

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static FIRST_AT: AtomicUsize = AtomicUsize::new(0);
    static SECOND_AT: AtomicUsize = AtomicUsize::new(0);

    fn first(_irq: usize, _sc: &SigContext) {
        FIRST_AT.store(ORDER.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
    }

    fn second(_irq: usize, _sc: &SigContext) {
        SECOND_AT.store(ORDER.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
    }

    #[test]
    fn chain_runs_in_registration_order() {
        let mut t = IrqTable::new();
        let mut pic = FakePic::default();
        t.register_irq(5, "alpha", first).unwrap();
        t.register_irq(5, "beta", second).unwrap();
        assert_eq!(t.chain_names(5)[..2], [Some("alpha"), Some("beta")]);

        ORDER.store(1, Ordering::Relaxed);
        t.dispatch(&mut pic, 5, &SigContext::default());
        assert_eq!(t.ticks(5), 1);
        assert!(
            FIRST_AT.load(Ordering::Relaxed) < SECOND_AT.load(Ordering::Relaxed),
            "chain must run in registration order"
        );
        assert_eq!((pic.masks, pic.acks, pic.unmasks), (1, 1, 1));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut t = IrqTable::new();
        t.register_irq(3, "dev", first).unwrap();
        assert_eq!(t.register_irq(3, "dev", first).unwrap_err(), Errno::EINVAL);
        assert_eq!(t.register_irq(99, "dev", first).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn only_the_tail_unregisters() {
        let mut t = IrqTable::new();
        t.register_irq(4, "a", first).unwrap();
        t.register_irq(4, "b", second).unwrap();
        assert_eq!(t.unregister_irq(4, first).unwrap_err(), Errno::EINVAL);
        t.unregister_irq(4, second).unwrap();
        assert_eq!(t.chain_names(4)[..2], [Some("a"), None]);
        // Now the former head is the tail and may go.
        t.unregister_irq(4, first).unwrap();
        assert_eq!(t.chain_names(4)[0], None);
    }

    #[test]
    fn spurious_lines_never_ack() {
        let mut t = IrqTable::new();
        let mut pic = FakePic::default();
        for _ in 0..10 {
            t.dispatch(&mut pic, 7, &SigContext::default());
        }
        assert_eq!(pic.acks, 0, "no chain, no ACK");
        assert_eq!(t.ticks(7), 0);
        assert_eq!(t.lines[7].spurious, 10);
    }

    static BH_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn bh_body() {
        BH_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn bottom_half_runs_once_per_mark() {
        let mut t = IrqTable::new();
        let bh = t.register_bh(bh_body).unwrap();
        BH_RUNS.store(0, Ordering::Relaxed);

        t.do_bh();
        assert_eq!(BH_RUNS.load(Ordering::Relaxed), 0, "inactive: no run");

        t.mark_bh(bh);
        t.do_bh();
        t.do_bh();
        assert_eq!(BH_RUNS.load(Ordering::Relaxed), 1, "one mark, one run");
    }
}
