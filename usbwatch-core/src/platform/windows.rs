//! Windows backend: device interface notifications on a message-only window
//!
//! Devices are keyed by their upper-cased instance id, derived from the
//! `GUID_DEVINTERFACE_USB_DEVICE` interface path. The window, its
//! notification registration and the message pump all live on the listener
//! thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::{size_of, zeroed};
use std::ptr::{addr_of, null, null_mut};
use std::time::Duration;

use tracing::{debug, trace};
use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW,
    SetupDiGetDeviceInterfaceDetailW, SetupDiGetDeviceRegistryPropertyW, DIGCF_DEVICEINTERFACE,
    DIGCF_PRESENT, HDEVINFO, SPDRP_ADDRESS, SPDRP_DEVICEDESC, SPDRP_FRIENDLYNAME, SPDRP_MFG,
    SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W, SP_DEVINFO_DATA,
};
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_CLASS_ALREADY_EXISTS, HWND, LPARAM, LRESULT, WPARAM,
};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, MsgWaitForMultipleObjects,
    PeekMessageW, RegisterClassExW, RegisterDeviceNotificationW, TranslateMessage,
    UnregisterDeviceNotification, HWND_MESSAGE, MSG, PM_REMOVE, QS_ALLINPUT, WM_DEVICECHANGE,
    WNDCLASSEXW,
};

use super::ids::{parse_interface_path, InterfacePath};
use crate::error::HotplugError;
use crate::source::{Backend, HotplugSource, RawEvent};
use crate::types::{DeviceRecord, PartialRecord};

const GUID_DEVINTERFACE_USB_DEVICE: GUID = GUID::from_u128(0xa5dcbf10_6530_11d2_901f_00c04fb951ed);

const DBT_DEVICEARRIVAL: WPARAM = 0x8000;
const DBT_DEVICEREMOVECOMPLETE: WPARAM = 0x8004;
const DBT_DEVTYP_DEVICEINTERFACE: u32 = 0x0000_0005;
const DEVICE_NOTIFY_WINDOW_HANDLE: u32 = 0x0000_0000;
const WAIT_FAILED: u32 = 0xFFFF_FFFF;

const CLASS_NAME: &str = "UsbwatchNotifyWindow";

#[repr(C)]
struct DevBroadcastHdr {
    size: u32,
    device_type: u32,
    reserved: u32,
}

#[repr(C)]
struct DevBroadcastDeviceInterface {
    size: u32,
    device_type: u32,
    reserved: u32,
    class_guid: GUID,
    name: [u16; 1],
}

enum Notice {
    Arrived(String),
    Removed(String),
}

thread_local! {
    // Filled by the window procedure while the listener pumps messages
    static NOTICES: RefCell<Vec<Notice>> = const { RefCell::new(Vec::new()) };
}

/// Hotplug backend using `RegisterDeviceNotificationW` and SetupAPI
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceNotifyBackend;

impl Backend for DeviceNotifyBackend {
    type Source = DeviceNotifySource;

    fn name(&self) -> &'static str {
        "devnotify"
    }

    fn open(&self) -> Result<DeviceNotifySource, HotplugError> {
        let class_name = wide(CLASS_NAME);

        // SAFETY: every pointer handed to the Win32 calls below outlives the
        // call; the class name buffer is copied by RegisterClassExW
        unsafe {
            let hinstance = GetModuleHandleW(null());

            let mut class: WNDCLASSEXW = zeroed();
            class.cbSize = size_of::<WNDCLASSEXW>() as u32;
            class.lpfnWndProc = Some(notify_wndproc);
            class.hInstance = hinstance;
            class.lpszClassName = class_name.as_ptr();
            if RegisterClassExW(&class) == 0 && GetLastError() != ERROR_CLASS_ALREADY_EXISTS {
                return Err(unavailable("RegisterClassExW"));
            }

            let hwnd = CreateWindowExW(
                0,
                class_name.as_ptr(),
                class_name.as_ptr(),
                0,
                0,
                0,
                0,
                0,
                HWND_MESSAGE,
                null_mut(),
                hinstance,
                null(),
            );
            if hwnd.is_null() {
                return Err(unavailable("CreateWindowExW"));
            }

            let mut filter: DevBroadcastDeviceInterface = zeroed();
            filter.size = size_of::<DevBroadcastDeviceInterface>() as u32;
            filter.device_type = DBT_DEVTYP_DEVICEINTERFACE;
            filter.class_guid = GUID_DEVINTERFACE_USB_DEVICE;

            let notify = RegisterDeviceNotificationW(
                hwnd,
                &filter as *const DevBroadcastDeviceInterface as *const c_void,
                DEVICE_NOTIFY_WINDOW_HANDLE,
            );
            if notify.is_null() {
                let err = unavailable("RegisterDeviceNotificationW");
                DestroyWindow(hwnd);
                return Err(err);
            }

            debug!("Device notifications registered on message window");
            Ok(DeviceNotifySource { hwnd, notify })
        }
    }
}

/// Message-only window with a live device notification registration
pub struct DeviceNotifySource {
    hwnd: HWND,
    notify: *mut c_void,
}

impl HotplugSource for DeviceNotifySource {
    fn enumerate(&mut self) -> Result<Vec<(String, DeviceRecord)>, HotplugError> {
        scan_interfaces()
    }

    fn wait(&mut self, timeout: Duration) -> Result<Vec<RawEvent>, HotplugError> {
        let timeout_ms = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;

        // SAFETY: no handles are passed; MSG is plain data filled by the OS
        unsafe {
            if MsgWaitForMultipleObjects(0, null(), 0, timeout_ms, QS_ALLINPUT) == WAIT_FAILED {
                return Err(std::io::Error::last_os_error().into());
            }
            let mut msg: MSG = zeroed();
            while PeekMessageW(&mut msg, null_mut(), 0, 0, PM_REMOVE) != 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }

        let notices = NOTICES.with(|n| std::mem::take(&mut *n.borrow_mut()));
        if notices.is_empty() {
            return Ok(Vec::new());
        }

        let needs_scan = notices.iter().any(|n| matches!(n, Notice::Arrived(_)));
        let present: HashMap<String, DeviceRecord> = if needs_scan {
            match scan_interfaces() {
                Ok(devices) => devices.into_iter().collect(),
                Err(e) => {
                    debug!("Rescan after arrival failed: {}", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let mut events = Vec::with_capacity(notices.len());
        for notice in notices {
            match notice {
                Notice::Arrived(path) => {
                    let Some(parsed) = parse_interface_path(&path) else {
                        trace!("Ignoring arrival of {}", path);
                        continue;
                    };
                    match present.get(&parsed.instance_id) {
                        Some(record) => events.push(RawEvent::Added {
                            key: parsed.instance_id,
                            record: record.clone(),
                        }),
                        None => debug!("{} vanished before it could be read", parsed.instance_id),
                    }
                }
                Notice::Removed(path) => {
                    let Some(parsed) = parse_interface_path(&path) else {
                        trace!("Ignoring removal of {}", path);
                        continue;
                    };
                    let fallback = removal_fallback(&parsed);
                    events.push(RawEvent::Removed {
                        key: parsed.instance_id,
                        fallback,
                    });
                }
            }
        }
        Ok(events)
    }
}

impl Drop for DeviceNotifySource {
    fn drop(&mut self) {
        // SAFETY: both handles were created in `open` and are released once
        unsafe {
            UnregisterDeviceNotification(self.notify);
            DestroyWindow(self.hwnd);
        }
        NOTICES.with(|n| n.borrow_mut().clear());
    }
}

unsafe extern "system" fn notify_wndproc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_DEVICECHANGE
        && (wparam == DBT_DEVICEARRIVAL || wparam == DBT_DEVICEREMOVECOMPLETE)
        && lparam != 0
    {
        let hdr = &*(lparam as *const DevBroadcastHdr);
        if hdr.device_type == DBT_DEVTYP_DEVICEINTERFACE {
            let iface = lparam as *const DevBroadcastDeviceInterface;
            let path = wide_ptr_to_string(addr_of!((*iface).name) as *const u16);
            let notice = if wparam == DBT_DEVICEARRIVAL {
                Notice::Arrived(path)
            } else {
                Notice::Removed(path)
            };
            NOTICES.with(|n| n.borrow_mut().push(notice));
        }
        return 1;
    }
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

/// Owned SetupAPI device information set
struct DevInfoList(HDEVINFO);

impl Drop for DevInfoList {
    fn drop(&mut self) {
        // SAFETY: the set was returned by SetupDiGetClassDevsW
        unsafe {
            SetupDiDestroyDeviceInfoList(self.0);
        }
    }
}

/// Every present USB device interface as `(instance id, record)`
fn scan_interfaces() -> Result<Vec<(String, DeviceRecord)>, HotplugError> {
    // SAFETY: the set handle is checked before use and released by DevInfoList
    let list = unsafe {
        let info = SetupDiGetClassDevsW(
            &GUID_DEVINTERFACE_USB_DEVICE,
            null(),
            null_mut(),
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        );
        if info as isize == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        DevInfoList(info)
    };

    let mut devices = Vec::new();
    for index in 0.. {
        // SAFETY: SP_DEVICE_INTERFACE_DATA is plain data with cbSize set
        let iface = unsafe {
            let mut iface: SP_DEVICE_INTERFACE_DATA = zeroed();
            iface.cbSize = size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
            if SetupDiEnumDeviceInterfaces(
                list.0,
                null(),
                &GUID_DEVINTERFACE_USB_DEVICE,
                index,
                &mut iface,
            ) == 0
            {
                break;
            }
            iface
        };

        match read_interface(&list, &iface) {
            Ok(device) => devices.push(device),
            Err(e) => debug!("Skipping interface {}: {}", index, e),
        }
    }
    Ok(devices)
}

fn read_interface(
    list: &DevInfoList,
    iface: &SP_DEVICE_INTERFACE_DATA,
) -> Result<(String, DeviceRecord), HotplugError> {
    // SAFETY: the detail buffer is u32-aligned and sized as SetupAPI asked
    let (path, devinfo) = unsafe {
        let mut required = 0u32;
        SetupDiGetDeviceInterfaceDetailW(list.0, iface, null_mut(), 0, &mut required, null_mut());
        if required == 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut buf = vec![0u32; (required as usize).div_ceil(4)];
        let detail = buf.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
        (*detail).cbSize = size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;

        let mut devinfo: SP_DEVINFO_DATA = zeroed();
        devinfo.cbSize = size_of::<SP_DEVINFO_DATA>() as u32;
        if SetupDiGetDeviceInterfaceDetailW(
            list.0,
            iface,
            detail,
            required,
            null_mut(),
            &mut devinfo,
        ) == 0
        {
            return Err(std::io::Error::last_os_error().into());
        }

        let path = wide_ptr_to_string(addr_of!((*detail).DevicePath) as *const u16);
        (path, devinfo)
    };

    let parsed = parse_interface_path(&path)
        .ok_or_else(|| HotplugError::device_read(&path, "unrecognised interface path"))?;
    if parsed.vendor_id.is_none() || parsed.product_id.is_none() {
        debug!("{}", HotplugError::device_read(&path, "no VID/PID in interface path"));
    }
    let vendor_id = parsed.vendor_id.unwrap_or(0);
    let product_id = parsed.product_id.unwrap_or(0);

    let name = registry_string(list, &devinfo, SPDRP_FRIENDLYNAME)
        .or_else(|| registry_string(list, &devinfo, SPDRP_DEVICEDESC))
        .unwrap_or_default();
    let manufacturer = registry_string(list, &devinfo, SPDRP_MFG).unwrap_or_default();
    let address = registry_dword(list, &devinfo, SPDRP_ADDRESS).unwrap_or(0);

    let record = DeviceRecord::new(vendor_id, product_id)
        .with_name(name)
        .with_manufacturer(manufacturer)
        .with_serial(parsed.serial.clone().unwrap_or_default())
        .with_location(0, address);
    Ok((parsed.instance_id, record))
}

fn registry_property(list: &DevInfoList, devinfo: &SP_DEVINFO_DATA, property: u32) -> Option<Vec<u8>> {
    // SAFETY: the buffer is sized from the first call's required length
    unsafe {
        let mut required = 0u32;
        SetupDiGetDeviceRegistryPropertyW(
            list.0,
            devinfo,
            property,
            null_mut(),
            null_mut(),
            0,
            &mut required,
        );
        if required == 0 {
            return None;
        }
        let mut buf = vec![0u8; required as usize];
        if SetupDiGetDeviceRegistryPropertyW(
            list.0,
            devinfo,
            property,
            null_mut(),
            buf.as_mut_ptr(),
            required,
            null_mut(),
        ) == 0
        {
            return None;
        }
        Some(buf)
    }
}

fn registry_string(list: &DevInfoList, devinfo: &SP_DEVINFO_DATA, property: u32) -> Option<String> {
    let bytes = registry_property(list, devinfo, property)?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    let value = String::from_utf16_lossy(&units).trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn registry_dword(list: &DevInfoList, devinfo: &SP_DEVINFO_DATA, property: u32) -> Option<u32> {
    let bytes = registry_property(list, devinfo, property)?;
    let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn removal_fallback(parsed: &InterfacePath) -> PartialRecord {
    PartialRecord {
        vendor_id: parsed.vendor_id,
        product_id: parsed.product_id,
        serial_number: parsed.serial.clone(),
        ..Default::default()
    }
}

fn unavailable(call: &str) -> HotplugError {
    HotplugError::PlatformUnavailable(format!(
        "{} failed: {}",
        call,
        std::io::Error::last_os_error()
    ))
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Read a NUL-terminated UTF-16 string
///
/// # Safety
/// `ptr` must point to a readable, NUL-terminated UTF-16 buffer.
unsafe fn wide_ptr_to_string(ptr: *const u16) -> String {
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}
