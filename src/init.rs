//! Host initialization parameters and the fatal-error hook.
//!
//! The host describes the compilation target once, up front; the resulting
//! [`InitParams`] value is owned by the [`crate::Program`] and consulted by
//! tarval arithmetic (modulo shift, float-to-int overflow), type layout
//! (pointer size, alignment) and the back end (stack alignment).

use std::sync::Mutex;
use std::sync::OnceLock;

/// Byte order of the compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Behavior of float-to-int conversion when the value does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatIntOverflow {
    /// The result is the minimum/maximum representable integer.
    Saturate,
    /// The result bit pattern is indeterminate (folds to a fixed pattern).
    Indefinite,
}

/// Target description handed to [`crate::Program::new`].
#[derive(Debug, Clone)]
pub struct InitParams {
    pub byte_order: ByteOrder,
    /// Pointer size in bytes.
    pub pointer_size: u32,
    /// Position-independent code requested.
    pub pic: bool,
    /// Target tolerates unaligned memory access.
    pub allow_unaligned: bool,
    /// Shift amounts are taken modulo this value (0 = no wrapping).
    pub modulo_shift: u32,
    /// Maximum number of shift/add steps a multiply may be decomposed into.
    pub max_mul_shifts: u32,
    /// Highest shift amount the decomposition may use.
    pub highest_shift: u32,
    /// Whether the target has a cheap high-word multiply.
    pub allow_mulh: bool,
    pub float_int_overflow: FloatIntOverflow,
    /// Natural machine word size in bits.
    pub machine_size: u32,
    /// Alignment of stack parameters in bytes.
    pub stack_param_align: u32,
}

impl InitParams {
    /// Parameters of a generic 64-bit little-endian machine.
    pub fn host() -> Self {
        InitParams {
            byte_order: ByteOrder::LittleEndian,
            pointer_size: 8,
            pic: false,
            allow_unaligned: true,
            modulo_shift: 64,
            max_mul_shifts: 4,
            highest_shift: 63,
            allow_mulh: true,
            float_int_overflow: FloatIntOverflow::Indefinite,
            machine_size: 64,
            stack_param_align: 8,
        }
    }
}

type PanicHook = Box<dyn Fn(&str) + Send + Sync>;

static PANIC_HOOK: OnceLock<Mutex<Option<PanicHook>>> = OnceLock::new();

fn hook_cell() -> &'static Mutex<Option<PanicHook>> {
    PANIC_HOOK.get_or_init(|| Mutex::new(None))
}

/// Replace the fatal-error hook. The hook runs before the process panics;
/// hosts use it to flush diagnostics or longjmp-style teardown.
pub fn set_panic_hook<F>(hook: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    *hook_cell().lock().unwrap() = Some(Box::new(hook));
}

/// Report an unrecoverable logic error and panic.
pub fn fatal(msg: &str) -> ! {
    if let Ok(guard) = hook_cell().lock() {
        if let Some(hook) = guard.as_ref() {
            hook(msg);
        }
    }
    panic!("{}", msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn host_params_are_64_bit() {
        let p = InitParams::host();
        assert_eq!(p.pointer_size, 8);
        assert_eq!(p.machine_size, 64);
        assert_eq!(p.modulo_shift, 64);
    }

    #[test]
    fn panic_hook_runs_before_panic() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        set_panic_hook(move |_| fired2.store(true, Ordering::SeqCst));
        let result = std::panic::catch_unwind(|| fatal("boom"));
        assert!(result.is_err());
        assert!(fired.load(Ordering::SeqCst));
        *hook_cell().lock().unwrap() = None;
    }
}
