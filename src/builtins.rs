//! Runtime helper functions reachable from generated code.
//!
//! Absolute link records name their target by `SymbolicAddress`; the linker
//! resolves each bucket to the address of the in-process helper below. The
//! math helpers have per-module profiling thunks generated alongside the
//! function code; `is_instrumentable` marks that subset.

/// Symbolic ids for the fixed runtime helpers absolute links resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum SymbolicAddress {
    /// Generic trampoline for calls that leave the module (import exits).
    InvokeFromInterpreter = 0,
    /// Interrupt/signal-handler entry.
    HandleInterrupt = 1,
    /// Stack-overflow report.
    ReportOverRecursed = 2,
    ToInt32 = 3,
    ModD = 4,
    SinD = 5,
    CosD = 6,
    TanD = 7,
    ExpD = 8,
    LogD = 9,
    PowD = 10,
    ATan2D = 11,
    MemCpy = 12,
    MemSet = 13,
}

impl SymbolicAddress {
    pub fn from_u32(v: u32) -> Option<Self> {
        use SymbolicAddress::*;
        Some(match v {
            0 => InvokeFromInterpreter,
            1 => HandleInterrupt,
            2 => ReportOverRecursed,
            3 => ToInt32,
            4 => ModD,
            5 => SinD,
            6 => CosD,
            7 => TanD,
            8 => ExpD,
            9 => LogD,
            10 => PowD,
            11 => ATan2D,
            12 => MemCpy,
            13 => MemSet,
            _ => return None,
        })
    }

    /// Address of the helper this id resolves to.
    pub fn address(self) -> u64 {
        use SymbolicAddress::*;
        match self {
            InvokeFromInterpreter => invoke_from_interpreter as usize as u64,
            HandleInterrupt => handle_interrupt as usize as u64,
            ReportOverRecursed => report_over_recursed as usize as u64,
            ToInt32 => to_int32 as usize as u64,
            ModD => mod_d as usize as u64,
            SinD => sin_d as usize as u64,
            CosD => cos_d as usize as u64,
            TanD => tan_d as usize as u64,
            ExpD => exp_d as usize as u64,
            LogD => log_d as usize as u64,
            PowD => pow_d as usize as u64,
            ATan2D => atan2_d as usize as u64,
            MemCpy => mem_cpy as usize as u64,
            MemSet => mem_set as usize as u64,
        }
    }

    /// Whether call sites for this helper are redirected through a
    /// per-module profiling thunk while profiling is enabled.
    pub fn is_instrumentable(self) -> bool {
        use SymbolicAddress::*;
        matches!(
            self,
            ToInt32 | ModD | SinD | CosD | TanD | ExpD | LogD | PowD | ATan2D
        )
    }
}

// The interpreter-boundary protocol: the exit trampoline marshals arguments
// into `argv`, calls here with the exit index, and reads results back out of
// `argv`. The interpreter side is an external collaborator; this stub only
// fixes the calling convention.
extern "C" fn invoke_from_interpreter(_exit_index: u32, _argc: u32, _argv: *mut u64) -> i32 {
    1
}

extern "C" fn handle_interrupt() -> i32 {
    0
}

extern "C" fn report_over_recursed() {}

extern "C" fn to_int32(x: f64) -> i32 {
    x as i64 as i32
}

extern "C" fn mod_d(x: f64, y: f64) -> f64 {
    x % y
}

extern "C" fn sin_d(x: f64) -> f64 {
    x.sin()
}

extern "C" fn cos_d(x: f64) -> f64 {
    x.cos()
}

extern "C" fn tan_d(x: f64) -> f64 {
    x.tan()
}

extern "C" fn exp_d(x: f64) -> f64 {
    x.exp()
}

extern "C" fn log_d(x: f64) -> f64 {
    x.ln()
}

extern "C" fn pow_d(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn atan2_d(y: f64, x: f64) -> f64 {
    y.atan2(x)
}

/// # Safety contract: generated code passes valid, non-overlapping ranges.
extern "C" fn mem_cpy(dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
    unsafe {
        std::ptr::copy_nonoverlapping(src, dst, len);
    }
    dst
}

extern "C" fn mem_set(dst: *mut u8, value: i32, len: usize) -> *mut u8 {
    unsafe {
        std::ptr::write_bytes(dst, value as u8, len);
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u32_roundtrip() {
        for id in 0..14 {
            let sym = SymbolicAddress::from_u32(id).unwrap();
            assert_eq!(sym as u32, id);
        }
        assert!(SymbolicAddress::from_u32(14).is_none());
    }

    #[test]
    fn test_addresses_are_distinct_and_nonzero() {
        let mut addrs: Vec<u64> = (0..14)
            .map(|id| SymbolicAddress::from_u32(id).unwrap().address())
            .collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 14);
        assert!(addrs.iter().all(|&a| a != 0));
    }

    #[test]
    fn test_instrumentable_subset() {
        assert!(SymbolicAddress::SinD.is_instrumentable());
        assert!(!SymbolicAddress::InvokeFromInterpreter.is_instrumentable());
        assert!(!SymbolicAddress::MemCpy.is_instrumentable());
    }
}
