// PCI passthrough device identifiers

use crate::ShiftError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Host PCI address of a passthrough device, e.g. `0000:01:00.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciId {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciId {
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            slot,
            function,
        }
    }

    /// Libvirt `<hostdev>` element for this device.
    pub fn hostdev_xml(&self) -> String {
        format!(
            r#"<hostdev mode='subsystem' type='pci' managed='yes'>
  <source>
    <address domain='0x{:04x}' bus='0x{:02x}' slot='0x{:02x}' function='0x{:x}'/>
  </source>
</hostdev>
"#,
            self.domain, self.bus, self.slot, self.function
        )
    }

    /// Collect the PCI hostdev source addresses from a domain XML dump, in document order.
    pub fn from_domain_xml(xml: &str) -> Vec<PciId> {
        let mut ids = Vec::new();
        let mut rest = xml;

        while let Some(start) = rest.find("<hostdev") {
            let section = &rest[start..];
            let end = section.find("</hostdev>").unwrap_or(section.len());
            let hostdev = &section[..end];

            if hostdev.contains("type='pci'") || hostdev.contains("type=\"pci\"") {
                if let Some(id) = hostdev
                    .find("<source>")
                    .and_then(|s| hostdev[s..].find("<address").map(|a| s + a))
                    .and_then(|a| parse_address_tag(&hostdev[a..]))
                {
                    ids.push(id);
                }
            }

            rest = &section[end..];
            if let Some(skip) = rest.find('>') {
                rest = &rest[skip + 1..];
            }
        }

        ids
    }
}

fn parse_address_tag(tag: &str) -> Option<PciId> {
    let tag = &tag[..tag.find("/>").unwrap_or(tag.len())];
    let domain = u16::from_str_radix(attribute(tag, "domain")?, 16).ok()?;
    let bus = u8::from_str_radix(attribute(tag, "bus")?, 16).ok()?;
    let slot = u8::from_str_radix(attribute(tag, "slot")?, 16).ok()?;
    let function = u8::from_str_radix(attribute(tag, "function")?, 16).ok()?;
    Some(PciId::new(domain, bus, slot, function))
}

fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value = &tag[start + pattern.len()..];
            let end = value.find(quote)?;
            return Some(value[..end].trim_start_matches("0x"));
        }
    }
    None
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciId {
    type Err = ShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ShiftError::MalformedRequest(format!("Invalid PCI address '{}'", s));

        let parts: Vec<&str> = s.trim().split(&[':', '.']).collect();
        // Domain is optional: "01:00.0" means "0000:01:00.0".
        let (domain, bus, slot, function) = match parts.as_slice() {
            [d, b, s, f] => (*d, *b, *s, *f),
            [b, s, f] => ("0", *b, *s, *f),
            _ => return Err(invalid()),
        };

        let slot = u8::from_str_radix(slot, 16).map_err(|_| invalid())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        if slot > 0x1f || function > 0x7 {
            return Err(invalid());
        }

        Ok(PciId {
            domain: u16::from_str_radix(domain, 16).map_err(|_| invalid())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| invalid())?,
            slot,
            function,
        })
    }
}

impl Serialize for PciId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PciId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
