//! Parsers for the identifier formats the OS hands out

/// Parse a hex ID as sysfs and udev print it (`04e8`, `4e8`)
pub(crate) fn parse_hex_u16(value: &str) -> Option<u16> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    u16::from_str_radix(value, 16).ok()
}

/// Pack a sysfs device name into a location id
///
/// `1-1.2` becomes `0x01120000`: bus in the top byte, then one nibble per
/// hub port, outermost first, at most six ports. Root hubs (`usb1`) have no
/// ports.
pub(crate) fn location_from_sysname(sysname: &str) -> Option<u32> {
    if let Some(bus) = sysname.strip_prefix("usb") {
        let bus: u8 = bus.parse().ok()?;
        return Some(u32::from(bus) << 24);
    }

    let (bus, ports) = sysname.split_once('-')?;
    let bus: u8 = bus.parse().ok()?;
    let mut location = u32::from(bus) << 24;
    for (depth, port) in ports.split('.').enumerate() {
        if depth >= 6 {
            break;
        }
        let port: u32 = port.parse().ok()?;
        location |= (port & 0xf) << (20 - 4 * depth);
    }
    Some(location)
}

/// Parse the udev `PRODUCT` property (`4e8/503b/400`) into VID/PID
pub(crate) fn parse_product_property(value: &str) -> Option<(u16, u16)> {
    let mut parts = value.split('/');
    let vid = parse_hex_u16(parts.next()?)?;
    let pid = parse_hex_u16(parts.next()?)?;
    Some((vid, pid))
}

/// Identity parsed from a Windows device interface path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterfacePath {
    /// Upper-cased device instance id, e.g. `USB\VID_04E8&PID_503B\0002F9A9`
    pub instance_id: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Absent when Windows generated the instance suffix itself
    pub serial: Option<String>,
}

/// Parse `\\?\USB#VID_04E8&PID_503B#0002F9A9#{a5dcbf10-...}`
pub(crate) fn parse_interface_path(path: &str) -> Option<InterfacePath> {
    let trimmed = path
        .strip_prefix(r"\\?\")
        .or_else(|| path.strip_prefix(r"\\.\"))
        .unwrap_or(path);
    let without_class = match trimmed.find("#{") {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };

    let segments: Vec<&str> = without_class.split('#').collect();
    if segments.len() < 3 || segments.iter().any(|s| s.is_empty()) {
        return None;
    }

    let mut vendor_id = None;
    let mut product_id = None;
    for part in segments[1].split('&') {
        let upper = part.to_ascii_uppercase();
        if let Some(v) = upper.strip_prefix("VID_") {
            vendor_id = parse_hex_u16(v);
        } else if let Some(p) = upper.strip_prefix("PID_") {
            product_id = parse_hex_u16(p);
        }
    }

    let suffix = segments[2];
    let serial = if suffix.contains('&') {
        None
    } else {
        Some(suffix.to_string())
    };

    Some(InterfacePath {
        instance_id: segments.join("\\").to_ascii_uppercase(),
        vendor_id,
        product_id,
        serial,
    })
}
