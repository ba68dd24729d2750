//! Logging helpers for rendering raw serial bytes on a single log line.

/// Render up to `max` bytes as space separated hex, e.g. `7e 01 ff`.
/// Longer input is cut and suffixed with `… (N bytes)` so noisy lines cannot flood the log.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    use std::fmt::Write;
    let shown = data.len().min(max);
    let mut out = String::with_capacity(shown * 3 + 16);
    for (i, b) in data[..shown].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > shown {
        let _ = write!(&mut out, " … ({} bytes)", data.len());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::hex_snippet;

    #[test]
    fn formats_and_truncates() {
        assert_eq!(hex_snippet(&[0x7e, 0x01, 0xff], 8), "7e 01 ff");
        assert_eq!(hex_snippet(&[1, 2, 3, 4], 2), "01 02 … (4 bytes)");
        assert_eq!(hex_snippet(&[], 4), "");
    }
}
