//! GDB remote packet module.
//!
//! Framing, escaping and checksums for the binary probe protocol, plus the
//! builders and decoders for every request the binary client issues.

use crate::error::{Result, TargetError};

const ESCAPE: u8 = b'}';
const ESCAPE_XOR: u8 = 0x20;

/// Escape `}`, `#` and `$` for transmission.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'}' | b'#' | b'$' => {
                escaped.push(ESCAPE);
                escaped.push(byte ^ ESCAPE_XOR);
            }
            _ => escaped.push(byte),
        }
    }
    escaped
}

/// Undo [`escape`].
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            if let Some(&next) = bytes.next() {
                plain.push(next ^ ESCAPE_XOR);
            }
        } else {
            plain.push(byte);
        }
    }
    plain
}

/// 8-bit sum of the unescaped payload.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Frame `payload` as `$<escaped payload>#<checksum>`.
pub fn make_packet(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(&escape(payload));
    packet.extend_from_slice(format!("#{:02x}", checksum(payload)).as_bytes());
    packet
}

fn checksum_field(packet: &[u8]) -> Option<u8> {
    let digits = std::str::from_utf8(&packet[packet.len() - 2..]).ok()?;
    u8::from_str_radix(digits, 16).ok()
}

pub fn is_valid_packet(packet: &[u8]) -> bool {
    let len = packet.len();
    if len < 4 || packet[0] != b'$' || packet[len - 3] != b'#' {
        return false;
    }
    match checksum_field(packet) {
        Some(sum) => sum == checksum(&unescape(&packet[1..len - 3])),
        None => false,
    }
}

/// The unescaped payload between `$` and `#`.
pub fn packet_data(packet: &[u8]) -> Vec<u8> {
    if packet.len() < 4 {
        return Vec::new();
    }
    unescape(&packet[1..packet.len() - 3])
}

/// Numeric code of an `E<hh>` reply.
pub fn error_code(packet: &[u8]) -> Option<u8> {
    if !is_valid_packet(packet) {
        return None;
    }
    let payload = packet_data(packet);
    if payload.len() != 3 || payload[0] != b'E' {
        return None;
    }
    let digits = std::str::from_utf8(&payload[1..]).ok()?;
    u8::from_str_radix(digits, 16).ok()
}

pub fn is_error_response(packet: &[u8]) -> bool {
    error_code(packet).is_some()
}

pub fn is_ok_response(packet: &[u8]) -> bool {
    is_valid_packet(packet) && packet_data(packet) == b"OK"
}

pub fn read_registers_request() -> Vec<u8> {
    make_packet(b"g")
}

/// One `m<addr>,<len>` request per chunk of at most `chunk_size` bytes.
pub fn read_memory_request(address: u32, length: usize, chunk_size: usize) -> Vec<Vec<u8>> {
    chunks(address, length, chunk_size)
        .map(|(address, len)| make_packet(format!("m{address:x},{len:x}").as_bytes()))
        .collect()
}

pub fn erase_flash_request(address: u32, length: u32) -> Vec<u8> {
    make_packet(format!("vFlashErase:{address:x},{length:x}").as_bytes())
}

/// One `vFlashWrite` request per chunk of `data`, addresses advancing.
pub fn write_flash_request(address: u32, data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let mut offset = 0;
    chunks(address, data.len(), chunk_size)
        .map(|(address, len)| {
            let mut payload = format!("vFlashWrite:{address:x},{len:x}:").into_bytes();
            payload.extend_from_slice(&data[offset..offset + len]);
            offset += len;
            make_packet(&payload)
        })
        .collect()
}

pub fn flash_done_request() -> Vec<u8> {
    make_packet(b"vFlashDone")
}

pub fn attach_request() -> Vec<u8> {
    make_packet(b"vAttach;1")
}

/// `monitor <command>`, hex encoded as `qRcmd` wants it.
pub fn monitor_request(command: &str) -> Vec<u8> {
    make_packet(format!("qRcmd,{}", hex::encode(command)).as_bytes())
}

pub fn single_step_request() -> Vec<u8> {
    make_packet(b"s")
}

pub fn continue_request() -> Vec<u8> {
    make_packet(b"c")
}

pub fn reset_request() -> Vec<u8> {
    make_packet(b"R00")
}

pub fn set_hardware_breakpoint_request(address: u32, length: u32) -> Vec<u8> {
    make_packet(format!("Z1,{address:x},{length:x}").as_bytes())
}

pub fn remove_hardware_breakpoint_request(address: u32, length: u32) -> Vec<u8> {
    make_packet(format!("z1,{address:x},{length:x}").as_bytes())
}

pub fn memory_map_read_request(offset: usize, length: usize) -> Vec<u8> {
    make_packet(format!("qXfer:memory-map:read::{offset:x},{length:x}").as_bytes())
}

/// Split `[address, address + length)` into `(address, len)` pieces.
fn chunks(mut address: u32, mut length: usize, chunk_size: usize) -> impl Iterator<Item = (u32, usize)> {
    let chunk_size = chunk_size.max(1);
    std::iter::from_fn(move || {
        if length == 0 {
            return None;
        }
        let len = length.min(chunk_size);
        let chunk = (address, len);
        length -= len;
        address = address.wrapping_add(len as u32);
        Some(chunk)
    })
}

/// Decode a `g` reply: eight hex digits per register, target byte order.
pub fn read_registers(reply: &[u8]) -> Result<Vec<u32>> {
    if !is_valid_packet(reply) {
        return Err(TargetError::protocol("malformed register reply"));
    }
    let payload = packet_data(reply);
    if payload.len() % 8 != 0 {
        return Err(TargetError::protocol(format!(
            "register reply length {} is not a multiple of 8",
            payload.len()
        )));
    }
    let bytes = hex::decode(&payload)
        .map_err(|e| TargetError::protocol(format!("bad register dump: {e}")))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

/// Concatenate hex-decoded replies to the requests built by
/// [`read_memory_request`] for `length` bytes in `chunk_size` pieces.
/// `None` if any reply is an error; a reply of the wrong size is a protocol
/// error.
pub fn read_memory(replies: &[Vec<u8>], length: usize, chunk_size: usize) -> Result<Option<Vec<u8>>> {
    let expected: Vec<usize> = chunks(0, length, chunk_size).map(|(_, len)| len).collect();
    if replies.len() != expected.len() {
        return Err(TargetError::protocol(format!(
            "{} memory replies for {} requests",
            replies.len(),
            expected.len()
        )));
    }
    let mut data = Vec::with_capacity(length);
    for (reply, &len) in replies.iter().zip(&expected) {
        if is_error_response(reply) {
            return Ok(None);
        }
        if !is_valid_packet(reply) {
            return Err(TargetError::protocol("malformed memory reply"));
        }
        let bytes = hex::decode(packet_data(reply))
            .map_err(|e| TargetError::protocol(format!("bad memory dump: {e}")))?;
        if bytes.len() != len {
            return Err(TargetError::protocol(format!(
                "memory reply carried {} bytes, requested {len}",
                bytes.len()
            )));
        }
        data.extend_from_slice(&bytes);
    }
    Ok(Some(data))
}

/// Payload of a `qXfer` reply and whether it was the last chunk.
pub fn memory_map_read_data(reply: &[u8]) -> Result<(Vec<u8>, bool)> {
    if !is_valid_packet(reply) {
        return Err(TargetError::protocol("malformed memory map reply"));
    }
    let payload = packet_data(reply);
    match payload.split_first() {
        Some((b'l', rest)) => Ok((rest.to_vec(), true)),
        Some((b'm', rest)) => Ok((rest.to_vec(), false)),
        _ => Err(TargetError::protocol(format!(
            "unexpected memory map reply {:?}",
            String::from_utf8_lossy(&payload)
        ))),
    }
}

/// Text carried by an `O` console-output packet.
pub fn console_output(payload: &[u8]) -> Option<String> {
    match payload.split_first() {
        Some((b'O', rest)) if payload != b"OK" => {
            hex::decode(rest).ok().map(|text| String::from_utf8_lossy(&text).into_owned())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let payloads: [&[u8]; 5] = [b"", b"plain", b"}#$", b"a}b#c$d", &[0x7d, 0x00, 0xff, 0x23]];
        for payload in payloads {
            assert_eq!(unescape(&escape(payload)), payload);
        }
        assert_eq!(escape(b"}"), b"}]");
        assert_eq!(escape(b"#"), b"}\x03");
        assert_eq!(escape(b"$"), b"}\x04");
    }

    #[test]
    fn test_ok_packet_framing() {
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(make_packet(b"OK"), b"$OK#9a");
        assert!(is_ok_response(b"$OK#9a"));
        assert!(!is_ok_response(b"$OK#9b"));
        assert!(!is_ok_response(b"$E01#a6"));
    }

    #[test]
    fn test_made_packets_are_valid() {
        let payloads: [&[u8]; 4] = [b"g", b"m8000000,100", b"vFlashWrite:0,3:}#$", &[0xff; 300]];
        for payload in payloads {
            let packet = make_packet(payload);
            assert!(is_valid_packet(&packet), "{packet:?}");
            assert_eq!(packet_data(&packet), payload);
        }
    }

    #[test]
    fn test_invalid_packets() {
        assert!(!is_valid_packet(b""));
        assert!(!is_valid_packet(b"$#0"));
        assert!(!is_valid_packet(b"OK#9a"));
        assert!(!is_valid_packet(b"$OK9a"));
        assert!(!is_valid_packet(b"$OK#zz"));
        assert!(is_valid_packet(b"$#00"));
    }

    #[test]
    fn test_error_code() {
        assert_eq!(error_code(&make_packet(b"E01")), Some(0x01));
        assert_eq!(error_code(&make_packet(b"Eff")), Some(0xff));
        assert_eq!(error_code(&make_packet(b"E1")), None);
        assert_eq!(error_code(&make_packet(b"E012")), None);
        assert_eq!(error_code(&make_packet(b"EXY")), None);
        assert_eq!(error_code(&make_packet(b"OK")), None);
        assert_eq!(error_code(b"$E01#00"), None);
    }

    #[test]
    fn test_read_memory_request_chunks() {
        let requests = read_memory_request(0, 10, 4);
        assert_eq!(requests.len(), 3);
        assert_eq!(packet_data(&requests[0]), b"m0,4");
        assert_eq!(packet_data(&requests[1]), b"m4,4");
        assert_eq!(packet_data(&requests[2]), b"m8,2");
        assert!(read_memory_request(0x100, 0, 4).is_empty());
    }

    #[test]
    fn test_write_flash_request_chunks() {
        let data: Vec<u8> = (0u8..10).collect();
        let requests = write_flash_request(0x0800_0000, &data, 4);
        assert_eq!(requests.len(), 3);
        let mut expected = b"vFlashWrite:8000008,2:".to_vec();
        expected.extend_from_slice(&[8, 9]);
        assert_eq!(packet_data(&requests[2]), expected);
        let mut first = b"vFlashWrite:8000000,4:".to_vec();
        first.extend_from_slice(&[0, 1, 2, 3]);
        assert_eq!(packet_data(&requests[0]), first);
    }

    #[test]
    fn test_simple_requests() {
        assert_eq!(packet_data(&erase_flash_request(0x0800_0000, 0x400)), b"vFlashErase:8000000,400");
        assert_eq!(packet_data(&monitor_request("swdp_scan")), b"qRcmd,737764705f7363616e");
        assert_eq!(packet_data(&set_hardware_breakpoint_request(0x1f0, 2)), b"Z1,1f0,2");
        assert_eq!(packet_data(&remove_hardware_breakpoint_request(0x1f0, 2)), b"z1,1f0,2");
        assert_eq!(read_registers_request(), make_packet(b"g"));
    }

    #[test]
    fn test_read_registers() {
        let reply = make_packet(b"78563412efbeadde");
        assert_eq!(read_registers(&reply).unwrap(), vec![0x1234_5678, 0xdead_beef]);
        assert!(read_registers(&make_packet(b"1234")).is_err());
        assert!(read_registers(&make_packet(b"zzzzzzzz")).is_err());
    }

    #[test]
    fn test_read_memory() {
        let replies = vec![make_packet(b"0102"), make_packet(b"ff")];
        assert_eq!(read_memory(&replies, 3, 2).unwrap(), Some(vec![1, 2, 0xff]));
        let replies = vec![make_packet(b"0102"), make_packet(b"E03")];
        assert_eq!(read_memory(&replies, 3, 2).unwrap(), None);
    }

    #[test]
    fn test_read_memory_rejects_short_chunks() {
        let replies = vec![make_packet(b"01"), make_packet(b"ff")];
        assert!(matches!(read_memory(&replies, 3, 2), Err(TargetError::Protocol(_))));
        let replies = vec![make_packet(b"0102")];
        assert!(matches!(read_memory(&replies, 3, 2), Err(TargetError::Protocol(_))));
    }

    #[test]
    fn test_console_output() {
        assert_eq!(console_output(b"O4869"), Some("Hi".to_string()));
        assert_eq!(console_output(b"OK"), None);
        assert_eq!(console_output(b"T05"), None);
    }

    #[test]
    fn test_memory_map_read_data() {
        let (data, last) = memory_map_read_data(&make_packet(b"l<memory-map/>")).unwrap();
        assert!(last);
        assert_eq!(data, b"<memory-map/>");
        let (_, last) = memory_map_read_data(&make_packet(b"m<memory")).unwrap();
        assert!(!last);
        assert!(memory_map_read_data(&make_packet(b"E01")).is_err());
    }
}
