//! GDB memory-map parsing and flash area resolution.

use crate::error::{Result, TargetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Ram,
    Rom,
    Flash,
}

/// One `<memory>` element of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: MemoryKind,
    pub start: u32,
    pub length: u32,
    /// Erase granularity of a flash region.
    pub block_size: Option<u32>,
}

impl MemoryRegion {
    /// Independently erasable areas of this region.
    pub fn erasable_areas(&self) -> Vec<FlashArea> {
        if self.kind != MemoryKind::Flash || self.length == 0 {
            return Vec::new();
        }
        let block = match self.block_size {
            Some(block) if block > 0 => block,
            _ => self.length,
        };
        let end = u64::from(self.start) + u64::from(self.length);
        let mut areas = Vec::new();
        let mut start = u64::from(self.start);
        while start < end {
            let size = u64::from(block).min(end - start);
            areas.push(FlashArea { start: start as u32, size: size as u32 });
            start += size;
        }
        areas
    }
}

/// A contiguous, independently erasable region of flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashArea {
    pub start: u32,
    pub size: u32,
}

impl FlashArea {
    fn end(self) -> u64 {
        u64::from(self.start) + u64::from(self.size)
    }
}

fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let key = format!(" {name}=");
    let at = tag.find(&key)? + key.len();
    let rest = &tag[at..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    rest.find(quote).map(|end| &rest[..end])
}

fn number(text: &str, what: &str) -> Result<u32> {
    parse_int::parse::<u32>(text.trim())
        .map_err(|e| TargetError::protocol(format!("bad {what} {text:?} in memory map: {e}")))
}

fn block_size(body: &str) -> Result<Option<u32>> {
    let mut rest = body;
    while let Some(at) = rest.find("<property") {
        rest = &rest[at..];
        let Some(close) = rest.find('>') else { break };
        let is_block_size = attribute(&rest[..close], "name") == Some("blocksize");
        rest = &rest[close + 1..];
        if is_block_size {
            let end = rest.find("</property>").ok_or_else(|| {
                TargetError::protocol("unterminated blocksize property in memory map")
            })?;
            return number(&rest[..end], "blocksize").map(Some);
        }
    }
    Ok(None)
}

/// Parse the `<memory-map>` document reported by the probe.
pub fn parse_memory_map(xml: &str) -> Result<Vec<MemoryRegion>> {
    let mut regions = Vec::new();
    let mut rest = xml;
    while let Some(at) = rest.find("<memory ") {
        rest = &rest[at..];
        let close = rest
            .find('>')
            .ok_or_else(|| TargetError::protocol("unterminated memory element in memory map"))?;
        let tag = &rest[..close];
        let self_closing = tag.ends_with('/');
        rest = &rest[close + 1..];

        let kind = match attribute(tag, "type") {
            Some("ram") => MemoryKind::Ram,
            Some("rom") => MemoryKind::Rom,
            Some("flash") => MemoryKind::Flash,
            other => {
                return Err(TargetError::protocol(format!(
                    "unknown memory type {other:?} in memory map"
                )))
            }
        };
        let start = number(
            attribute(tag, "start").ok_or_else(|| TargetError::protocol("memory element without start"))?,
            "start",
        )?;
        let length = number(
            attribute(tag, "length").ok_or_else(|| TargetError::protocol("memory element without length"))?,
            "length",
        )?;

        let block_size = if self_closing {
            None
        } else {
            let end = rest.find("</memory>").unwrap_or(rest.len());
            let body = &rest[..end];
            rest = &rest[end..];
            block_size(body)?
        };
        regions.push(MemoryRegion { kind, start, length, block_size });
    }
    Ok(regions)
}

/// Erasable areas touched by `[address, address + length)`, in address order.
pub fn flash_areas_for_range(regions: &[MemoryRegion], address: u32, length: u32) -> Vec<FlashArea> {
    let start = u64::from(address);
    let end = start + u64::from(length);
    let mut areas: Vec<FlashArea> = regions
        .iter()
        .flat_map(MemoryRegion::erasable_areas)
        .filter(|area| u64::from(area.start) < end && start < area.end())
        .collect();
    areas.sort_by_key(|area| area.start);
    areas
}

#[cfg(test)]
mod tests {
    use super::*;

    const STM32F103_MAP: &str = r#"<?xml version="1.0"?>
<!DOCTYPE memory-map PUBLIC "+//IDN gnu.org//DTD GDB Memory Map V1.0//EN" "http://sourceware.org/gdb/gdb-memory-map.dtd">
<memory-map>
  <memory type="flash" start="0x8000000" length="0x10000">
    <property name="blocksize">0x400</property>
  </memory>
  <memory type="ram" start="0x20000000" length="0x5000"/>
</memory-map>"#;

    #[test]
    fn test_parse_memory_map() {
        let regions = parse_memory_map(STM32F103_MAP).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(
            regions[0],
            MemoryRegion {
                kind: MemoryKind::Flash,
                start: 0x0800_0000,
                length: 0x1_0000,
                block_size: Some(0x400)
            }
        );
        assert_eq!(regions[1].kind, MemoryKind::Ram);
        assert_eq!(regions[1].block_size, None);
    }

    #[test]
    fn test_areas_for_range() {
        let regions = parse_memory_map(STM32F103_MAP).unwrap();
        let areas = flash_areas_for_range(&regions, 0x0800_0200, 0x400);
        assert_eq!(
            areas,
            vec![
                FlashArea { start: 0x0800_0000, size: 0x400 },
                FlashArea { start: 0x0800_0400, size: 0x400 }
            ]
        );
        assert!(flash_areas_for_range(&regions, 0x2000_0000, 0x100).is_empty());
        assert_eq!(flash_areas_for_range(&regions, 0x0800_0000, 0x400).len(), 1);
    }

    #[test]
    fn test_flash_without_blocksize_is_one_area() {
        let regions = parse_memory_map(r#"<memory-map><memory type="flash" start="0" length="0x800"></memory></memory-map>"#).unwrap();
        assert_eq!(regions[0].erasable_areas(), vec![FlashArea { start: 0, size: 0x800 }]);
    }

    #[test]
    fn test_malformed_map() {
        assert!(parse_memory_map(r#"<memory type="flash" start="zz" length="1"/>"#).is_err());
        assert!(parse_memory_map(r#"<memory type="disk" start="0" length="1"/>"#).is_err());
        assert!(parse_memory_map("<memory-map></memory-map>").unwrap().is_empty());
    }
}
