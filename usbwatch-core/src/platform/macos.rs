//! macOS backend: IOKit matching notifications on the listener's run loop
//!
//! Devices are keyed by their IORegistry entry id, which stays stable for
//! the lifetime of an attachment and is still readable from a terminated
//! service.

use std::cell::RefCell;
use std::ffi::{c_char, c_void};
use std::time::Duration;

use core_foundation::base::{CFType, TCFType};
use core_foundation::number::CFNumber;
use core_foundation::runloop::{kCFRunLoopDefaultMode, CFRunLoop, CFRunLoopSource};
use core_foundation::string::CFString;
use core_foundation_sys::base::{kCFAllocatorDefault, CFAllocatorRef, CFTypeRef};
use core_foundation_sys::dictionary::{CFDictionaryRef, CFMutableDictionaryRef};
use core_foundation_sys::runloop::CFRunLoopSourceRef;
use core_foundation_sys::string::CFStringRef;
use tracing::debug;

use crate::error::HotplugError;
use crate::source::{Backend, HotplugSource, RawEvent};
use crate::types::{DeviceRecord, PartialRecord};

#[allow(non_camel_case_types)]
type kern_return_t = i32;
#[allow(non_camel_case_types)]
type mach_port_t = u32;
#[allow(non_camel_case_types)]
type io_object_t = mach_port_t;
#[allow(non_camel_case_types)]
type io_iterator_t = io_object_t;
type IONotificationPortRef = *mut c_void;
type IOServiceMatchingCallback = unsafe extern "C" fn(refcon: *mut c_void, iterator: io_iterator_t);

const KERN_SUCCESS: kern_return_t = 0;
const IO_MAIN_PORT_DEFAULT: mach_port_t = 0;

const USB_DEVICE_CLASS: &[u8] = b"IOUSBHostDevice\0";
const FIRST_MATCH_NOTIFICATION: &[u8] = b"IOServiceFirstMatch\0";
const TERMINATED_NOTIFICATION: &[u8] = b"IOServiceTerminate\0";

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOServiceMatching(name: *const c_char) -> CFMutableDictionaryRef;
    fn IOServiceGetMatchingServices(
        main_port: mach_port_t,
        matching: CFDictionaryRef,
        existing: *mut io_iterator_t,
    ) -> kern_return_t;
    fn IONotificationPortCreate(main_port: mach_port_t) -> IONotificationPortRef;
    fn IONotificationPortDestroy(notify: IONotificationPortRef);
    fn IONotificationPortGetRunLoopSource(notify: IONotificationPortRef) -> CFRunLoopSourceRef;
    fn IOServiceAddMatchingNotification(
        notify: IONotificationPortRef,
        notification_type: *const c_char,
        matching: CFDictionaryRef,
        callback: IOServiceMatchingCallback,
        refcon: *mut c_void,
        notification: *mut io_iterator_t,
    ) -> kern_return_t;
    fn IOIteratorNext(iterator: io_iterator_t) -> io_object_t;
    fn IOObjectRelease(object: io_object_t) -> kern_return_t;
    fn IORegistryEntryGetRegistryEntryID(entry: io_object_t, entry_id: *mut u64) -> kern_return_t;
    fn IORegistryEntryCreateCFProperty(
        entry: io_object_t,
        key: CFStringRef,
        allocator: CFAllocatorRef,
        options: u32,
    ) -> CFTypeRef;
}

type Pending = RefCell<Vec<RawEvent>>;

/// Hotplug backend on top of IOKit
#[derive(Debug, Clone, Copy, Default)]
pub struct IoKitBackend;

impl Backend for IoKitBackend {
    type Source = IoKitSource;

    fn name(&self) -> &'static str {
        "iokit"
    }

    fn open(&self) -> Result<IoKitSource, HotplugError> {
        // SAFETY: the notification port is checked for null; everything
        // acquired here is owned by IoKitSource and released in its Drop
        unsafe {
            let port = IONotificationPortCreate(IO_MAIN_PORT_DEFAULT);
            if port.is_null() {
                return Err(HotplugError::PlatformUnavailable(
                    "IONotificationPortCreate returned null".into(),
                ));
            }

            let run_loop_source =
                CFRunLoopSource::wrap_under_get_rule(IONotificationPortGetRunLoopSource(port));
            let run_loop = CFRunLoop::get_current();
            run_loop.add_source(&run_loop_source, kCFRunLoopDefaultMode);

            let mut source = IoKitSource {
                port,
                run_loop,
                run_loop_source,
                attached_iter: 0,
                detached_iter: 0,
                pending: Box::new(RefCell::new(Vec::new())),
            };
            let refcon = &*source.pending as *const Pending as *mut c_void;

            source.attached_iter =
                add_notification(port, FIRST_MATCH_NOTIFICATION, on_attached, refcon)?;
            source.detached_iter =
                add_notification(port, TERMINATED_NOTIFICATION, on_detached, refcon)?;

            // Draining arms the notifications; present devices come from enumerate()
            release_all(source.attached_iter);
            release_all(source.detached_iter);

            debug!("IOKit notifications armed");
            Ok(source)
        }
    }
}

/// Notification port attached to the listener thread's run loop
pub struct IoKitSource {
    port: IONotificationPortRef,
    run_loop: CFRunLoop,
    run_loop_source: CFRunLoopSource,
    attached_iter: io_iterator_t,
    detached_iter: io_iterator_t,
    pending: Box<Pending>,
}

impl HotplugSource for IoKitSource {
    fn enumerate(&mut self) -> Result<Vec<(String, DeviceRecord)>, HotplugError> {
        let mut devices = Vec::new();
        // SAFETY: IOServiceGetMatchingServices consumes the matching dictionary
        unsafe {
            let matching = IOServiceMatching(USB_DEVICE_CLASS.as_ptr() as *const c_char);
            if matching.is_null() {
                return Err(HotplugError::PlatformUnavailable(
                    "IOServiceMatching returned null".into(),
                ));
            }
            let mut iter: io_iterator_t = 0;
            let kr = IOServiceGetMatchingServices(IO_MAIN_PORT_DEFAULT, matching as _, &mut iter);
            if kr != KERN_SUCCESS {
                return Err(HotplugError::PlatformUnavailable(format!(
                    "IOServiceGetMatchingServices failed: {:#x}",
                    kr
                )));
            }
            while let Some(service) = next_service(iter) {
                match read_service(service) {
                    Ok(device) => devices.push(device),
                    Err(e) => debug!("Skipping service: {}", e),
                }
                IOObjectRelease(service);
            }
            IOObjectRelease(iter);
        }
        Ok(devices)
    }

    fn wait(&mut self, timeout: Duration) -> Result<Vec<RawEvent>, HotplugError> {
        // SAFETY: reading an immutable CoreFoundation constant
        let mode = unsafe { kCFRunLoopDefaultMode };
        CFRunLoop::run_in_mode(mode, timeout, true);
        Ok(std::mem::take(&mut *self.pending.borrow_mut()))
    }
}

impl Drop for IoKitSource {
    fn drop(&mut self) {
        // SAFETY: iterators and port were created in `open` and are released once
        unsafe {
            self.run_loop
                .remove_source(&self.run_loop_source, kCFRunLoopDefaultMode);
            if self.attached_iter != 0 {
                IOObjectRelease(self.attached_iter);
            }
            if self.detached_iter != 0 {
                IOObjectRelease(self.detached_iter);
            }
            IONotificationPortDestroy(self.port);
        }
    }
}

unsafe fn add_notification(
    port: IONotificationPortRef,
    kind: &[u8],
    callback: IOServiceMatchingCallback,
    refcon: *mut c_void,
) -> Result<io_iterator_t, HotplugError> {
    let matching = IOServiceMatching(USB_DEVICE_CLASS.as_ptr() as *const c_char);
    if matching.is_null() {
        return Err(HotplugError::PlatformUnavailable(
            "IOServiceMatching returned null".into(),
        ));
    }
    let mut iter: io_iterator_t = 0;
    let kr = IOServiceAddMatchingNotification(
        port,
        kind.as_ptr() as *const c_char,
        matching as _,
        callback,
        refcon,
        &mut iter,
    );
    if kr != KERN_SUCCESS {
        return Err(HotplugError::PlatformUnavailable(format!(
            "IOServiceAddMatchingNotification failed: {:#x}",
            kr
        )));
    }
    Ok(iter)
}

unsafe fn next_service(iter: io_iterator_t) -> Option<io_object_t> {
    match IOIteratorNext(iter) {
        0 => None,
        service => Some(service),
    }
}

unsafe fn release_all(iter: io_iterator_t) {
    while let Some(service) = next_service(iter) {
        IOObjectRelease(service);
    }
}

unsafe extern "C" fn on_attached(refcon: *mut c_void, iter: io_iterator_t) {
    let pending = &*(refcon as *const Pending);
    while let Some(service) = next_service(iter) {
        match read_service(service) {
            Ok((key, record)) => pending.borrow_mut().push(RawEvent::Added { key, record }),
            Err(e) => debug!("Ignoring attached service: {}", e),
        }
        IOObjectRelease(service);
    }
}

unsafe extern "C" fn on_detached(refcon: *mut c_void, iter: io_iterator_t) {
    let pending = &*(refcon as *const Pending);
    while let Some(service) = next_service(iter) {
        if let Some(key) = entry_key(service) {
            let fallback = PartialRecord {
                location_id: number_property(service, "locationID").map(|v| v as u32),
                vendor_id: number_property(service, "idVendor").map(|v| v as u16),
                product_id: number_property(service, "idProduct").map(|v| v as u16),
                device_name: string_property(service, "USB Product Name"),
                manufacturer: string_property(service, "USB Vendor Name"),
                serial_number: string_property(service, "USB Serial Number"),
                device_address: number_property(service, "USB Address").map(|v| v as u32),
            };
            pending
                .borrow_mut()
                .push(RawEvent::Removed { key, fallback });
        }
        IOObjectRelease(service);
    }
}

unsafe fn entry_key(service: io_object_t) -> Option<String> {
    let mut id = 0u64;
    if IORegistryEntryGetRegistryEntryID(service, &mut id) != KERN_SUCCESS {
        return None;
    }
    Some(format!("{:#x}", id))
}

unsafe fn read_service(service: io_object_t) -> Result<(String, DeviceRecord), HotplugError> {
    let key = entry_key(service)
        .ok_or_else(|| HotplugError::device_read("<unknown>", "no registry entry id"))?;
    let vendor_id = number_property(service, "idVendor").unwrap_or_else(|| {
        debug!("{}", HotplugError::device_read(&key, "idVendor missing"));
        0
    });
    let product_id = number_property(service, "idProduct").unwrap_or_else(|| {
        debug!("{}", HotplugError::device_read(&key, "idProduct missing"));
        0
    });

    let record = DeviceRecord::new(vendor_id as u16, product_id as u16)
        .with_name(string_property(service, "USB Product Name").unwrap_or_default())
        .with_manufacturer(string_property(service, "USB Vendor Name").unwrap_or_default())
        .with_serial(string_property(service, "USB Serial Number").unwrap_or_default())
        .with_location(
            number_property(service, "locationID").unwrap_or(0) as u32,
            number_property(service, "USB Address").unwrap_or(0) as u32,
        );
    Ok((key, record))
}

unsafe fn property(service: io_object_t, name: &str) -> Option<CFType> {
    let key = CFString::new(name);
    let value =
        IORegistryEntryCreateCFProperty(service, key.as_concrete_TypeRef(), kCFAllocatorDefault, 0);
    if value.is_null() {
        None
    } else {
        Some(CFType::wrap_under_create_rule(value))
    }
}

unsafe fn number_property(service: io_object_t, name: &str) -> Option<i64> {
    property(service, name)?.downcast::<CFNumber>()?.to_i64()
}

unsafe fn string_property(service: io_object_t, name: &str) -> Option<String> {
    property(service, name)?
        .downcast::<CFString>()
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}
