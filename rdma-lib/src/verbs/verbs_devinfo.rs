use std::{ffi::CStr, sync::Arc};

use libibverbs_sys::{ibv_device, ibv_free_device_list, ibv_get_device_list, ibv_get_device_name};

use crate::error::{Result, VerbsError};

/// Snapshot of the RDMA devices present on the host.
pub struct VerbsDeviceList {
    list: *mut *mut ibv_device,
    num_devices: usize,
}

unsafe impl Send for VerbsDeviceList {}
unsafe impl Sync for VerbsDeviceList {}

impl VerbsDeviceList {
    pub fn get_all_devices() -> Result<Arc<Self>> {
        let mut num_devices = 0;
        let list = unsafe { ibv_get_device_list(&raw mut num_devices) };
        if list.is_null() {
            Err(VerbsError::with_last_os_error("ibv_get_device_list").into())
        } else {
            Ok(Arc::new(Self { list, num_devices: num_devices as usize }))
        }
    }

    pub fn len(&self) -> usize {
        self.num_devices
    }

    pub fn is_empty(&self) -> bool {
        self.num_devices == 0
    }

    pub fn name(&self, index: usize) -> Option<String> {
        if index >= self.num_devices {
            return None;
        }
        let name = unsafe { ibv_get_device_name(*self.list.add(index)) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    pub fn names(&self) -> Vec<String> {
        (0..self.num_devices).filter_map(|i| self.name(i)).collect()
    }

    /// Index of the device called `name`, e.g. `mlx5_0`.
    pub fn find(&self, name: &str) -> Option<usize> {
        (0..self.num_devices).find(|&i| self.name(i).as_deref() == Some(name))
    }
}

impl Drop for VerbsDeviceList {
    fn drop(&mut self) {
        unsafe { ibv_free_device_list(self.list) };
    }
}
