use std::fmt::Write;

/// Formats `data` as the classic bordered offset/hex/ASCII dump for debug
/// logging. Returns the whole table as one string so callers can emit it
/// through a single log record.
pub fn hexdump(data: &[u8]) -> String {
    let border = "+------+-------------------------------------------------+------------------+\n";
    let mut out = String::new();
    out.push_str(border);
    for (offset, chunk) in data.chunks(16).enumerate() {
        write!(out, "| {:04x} | ", offset * 16).unwrap();
        for index in 0..16 {
            match chunk.get(index) {
                Some(byte) => write!(out, "{:02x} ", byte).unwrap(),
                None => out.push_str("   "),
            }
        }
        out.push_str("| ");
        for index in 0..16 {
            match chunk.get(index) {
                Some(&byte) if (32..=126).contains(&byte) => out.push(byte as char),
                Some(_) => out.push('.'),
                None => out.push(' '),
            }
        }
        out.push_str(" |\n");
    }
    out.push_str(border);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_formats_offsets_and_ascii() {
        let data = b"This is a test for hex dump function.";
        let dump = hexdump(data);
        assert!(dump.contains("| 0000 |"));
        assert!(dump.contains("| 0010 |"));
        assert!(dump.contains("| 0020 |"));
        assert!(dump.contains("This is a test f"));
        assert!(dump.starts_with("+------+"));
    }

    #[test]
    fn hexdump_masks_non_printable_bytes() {
        let dump = hexdump(&[0x00, 0x41, 0xff]);
        assert!(dump.contains("00 41 ff"));
        assert!(dump.contains(".A."));
    }
}
