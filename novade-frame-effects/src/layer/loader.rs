//! Structures the Vulkan loader hands a layer through `pNext` chains.
//!
//! These mirror `vk_layer.h`, which is not part of the registry `ash` is
//! generated from.

use ash::vk::{self, Handle};
use std::ffi::c_void;

pub const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
pub const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

/// `VkLayerFunction` values.
pub const LAYER_LINK_INFO: i32 = 0;
pub const LOADER_DATA_CALLBACK: i32 = 1;

pub type SetDeviceLoaderDataFn =
    unsafe extern "system" fn(device: vk::Device, object: *mut c_void) -> vk::Result;
pub type SetInstanceLoaderDataFn =
    unsafe extern "system" fn(instance: vk::Instance, object: *mut c_void) -> vk::Result;

#[repr(C)]
pub struct LayerInstanceLink {
    pub next: *mut LayerInstanceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_physical_device_proc_addr: *const c_void,
}

#[repr(C)]
pub union LayerInstanceCreateInfoPayload {
    pub layer_info: *mut LayerInstanceLink,
    pub set_instance_loader_data: SetInstanceLoaderDataFn,
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerInstanceCreateInfoPayload,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub next: *mut LayerDeviceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub union LayerDeviceCreateInfoPayload {
    pub layer_info: *mut LayerDeviceLink,
    pub set_device_loader_data: SetDeviceLoaderDataFn,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerDeviceCreateInfoPayload,
}

/// Common prefix of every Vulkan structure.
#[repr(C)]
struct ChainHeader {
    s_type: vk::StructureType,
    p_next: *const c_void,
}

/// First structure in the chain starting at `p_next` with the given type and
/// `function`.
///
/// # Safety
/// `p_next` must be a valid Vulkan `pNext` chain.
unsafe fn find_in_chain(
    p_next: *const c_void,
    s_type: vk::StructureType,
    function: i32,
) -> *mut c_void {
    let mut current = p_next;
    while !current.is_null() {
        let header = &*(current as *const ChainHeader);
        if header.s_type == s_type {
            // Both loader structures share this layout up to `function`.
            let candidate = &*(current as *const LayerInstanceCreateInfo);
            if candidate.function == function {
                return current as *mut c_void;
            }
        }
        current = header.p_next;
    }
    std::ptr::null_mut()
}

/// Next-layer entry points for `vkCreateInstance`.
pub struct InstanceChain {
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
}

/// Reads our link from the instance create info and advances it for the next layer.
///
/// # Safety
/// `create_info` must be the application's create info as passed by the loader.
pub unsafe fn take_instance_link(
    create_info: *const vk::InstanceCreateInfo,
) -> Option<InstanceChain> {
    let info = find_in_chain((*create_info).p_next, LOADER_INSTANCE_CREATE_INFO, LAYER_LINK_INFO)
        as *mut LayerInstanceCreateInfo;
    if info.is_null() || (*info).u.layer_info.is_null() {
        return None;
    }
    let link = (*info).u.layer_info;
    let next_get_instance_proc_addr = (*link).next_get_instance_proc_addr;
    (*info).u.layer_info = (*link).next;
    Some(InstanceChain {
        next_get_instance_proc_addr,
    })
}

/// Next-layer entry points and loader callback for `vkCreateDevice`.
pub struct DeviceChain {
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub set_device_loader_data: Option<SetDeviceLoaderDataFn>,
}

/// # Safety
/// `create_info` must be the application's create info as passed by the loader.
pub unsafe fn take_device_link(create_info: *const vk::DeviceCreateInfo) -> Option<DeviceChain> {
    let p_next = (*create_info).p_next;
    let info = find_in_chain(p_next, LOADER_DEVICE_CREATE_INFO, LAYER_LINK_INFO)
        as *mut LayerDeviceCreateInfo;
    if info.is_null() || (*info).u.layer_info.is_null() {
        return None;
    }
    let link = (*info).u.layer_info;
    let chain = DeviceChain {
        next_get_instance_proc_addr: (*link).next_get_instance_proc_addr,
        next_get_device_proc_addr: (*link).next_get_device_proc_addr,
        set_device_loader_data: None,
    };
    (*info).u.layer_info = (*link).next;

    let callback = find_in_chain(p_next, LOADER_DEVICE_CREATE_INFO, LOADER_DATA_CALLBACK)
        as *const LayerDeviceCreateInfo;
    let set_device_loader_data =
        (!callback.is_null()).then(|| (*callback).u.set_device_loader_data);
    Some(DeviceChain {
        set_device_loader_data,
        ..chain
    })
}

/// The loader's dispatch table pointer, stored in the first word of every
/// dispatchable handle. Objects sharing a table belong to the same instance or
/// device.
///
/// # Safety
/// `handle` must be a live dispatchable handle.
pub unsafe fn dispatch_key<T: Handle>(handle: T) -> usize {
    *(handle.as_raw() as usize as *const usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "system" fn fake_get_instance_proc_addr(
        _instance: vk::Instance,
        _name: *const std::os::raw::c_char,
    ) -> vk::PFN_vkVoidFunction {
        None
    }

    unsafe extern "system" fn fake_get_device_proc_addr(
        _device: vk::Device,
        _name: *const std::os::raw::c_char,
    ) -> vk::PFN_vkVoidFunction {
        None
    }

    unsafe extern "system" fn fake_set_loader_data(
        _device: vk::Device,
        _object: *mut c_void,
    ) -> vk::Result {
        vk::Result::SUCCESS
    }

    #[test]
    fn device_link_is_consumed_and_callback_found() {
        let mut next_link = LayerDeviceLink {
            next: std::ptr::null_mut(),
            next_get_instance_proc_addr: fake_get_instance_proc_addr,
            next_get_device_proc_addr: fake_get_device_proc_addr,
        };
        let mut our_link = LayerDeviceLink {
            next: &mut next_link,
            next_get_instance_proc_addr: fake_get_instance_proc_addr,
            next_get_device_proc_addr: fake_get_device_proc_addr,
        };
        let callback = LayerDeviceCreateInfo {
            s_type: LOADER_DEVICE_CREATE_INFO,
            p_next: std::ptr::null(),
            function: LOADER_DATA_CALLBACK,
            u: LayerDeviceCreateInfoPayload {
                set_device_loader_data: fake_set_loader_data,
            },
        };
        let mut link_info = LayerDeviceCreateInfo {
            s_type: LOADER_DEVICE_CREATE_INFO,
            p_next: &callback as *const _ as *const c_void,
            function: LAYER_LINK_INFO,
            u: LayerDeviceCreateInfoPayload {
                layer_info: &mut our_link,
            },
        };
        let create_info = vk::DeviceCreateInfo {
            p_next: &mut link_info as *mut _ as *const c_void,
            ..Default::default()
        };

        let chain = unsafe { take_device_link(&create_info) }.unwrap();
        assert!(chain.set_device_loader_data.is_some());
        let advanced = unsafe { link_info.u.layer_info };
        assert_eq!(advanced, &mut next_link as *mut LayerDeviceLink);
    }

    #[test]
    fn missing_link_is_none() {
        let create_info = vk::InstanceCreateInfo::default();
        assert!(unsafe { take_instance_link(&create_info) }.is_none());
    }

    #[test]
    fn dispatch_key_reads_the_first_word() {
        let table = 0xfeed_usize;
        let object: Box<usize> = Box::new(table);
        let handle = vk::Device::from_raw(&*object as *const usize as u64);
        assert_eq!(unsafe { dispatch_key(handle) }, 0xfeed);
    }
}
