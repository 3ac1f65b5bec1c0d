use std::mem::MaybeUninit;

use crate::error::{Result, VerbsError};

/// Binds the calling thread to a single CPU.
pub fn pin_current_thread(cpu: u16) -> Result<()> {
    let cpu = usize::from(cpu);
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(VerbsError::with_code(libc::EINVAL, "pin_current_thread").into());
    }

    let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();
    let ret = unsafe {
        let set = set.assume_init_mut();
        libc::CPU_SET(cpu, set);
        libc::pthread_setaffinity_np(libc::pthread_self(), size_of::<libc::cpu_set_t>(), set)
    };
    match ret {
        0 => Ok(()),
        code => Err(VerbsError::with_code(code, "pthread_setaffinity_np").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_cpu_outside_set() {
        let err = pin_current_thread(u16::MAX).unwrap_err();
        assert!(err.to_string().contains("pin_current_thread"));
    }
}
