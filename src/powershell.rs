//! PowerShell script encoding.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};

/// Wrap `script` as a `powershell.exe -EncodedCommand` invocation.
///
/// PowerShell expects the encoded command as base64 of the UTF-16LE script
/// text. Returns `None` when there is nothing to encode.
pub fn encode(script: &str) -> Option<String> {
    if script.trim().is_empty() {
        return None;
    }

    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    Some(format!(
        "powershell.exe -EncodedCommand {}",
        BASE64_STANDARD.encode(utf16)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_script_is_not_encodable() {
        assert_eq!(encode(""), None);
        assert_eq!(encode("   \r\n\t"), None);
    }

    #[test]
    fn test_known_encoding() {
        // "dir" as UTF-16LE is 64 00 69 00 72 00
        assert_eq!(
            encode("dir").as_deref(),
            Some("powershell.exe -EncodedCommand ZABpAHIA")
        );
    }

    #[test]
    fn test_non_ascii_round_trips() {
        let encoded = encode("Write-Output 'héllo ✓'").unwrap();
        let payload = encoded
            .strip_prefix("powershell.exe -EncodedCommand ")
            .unwrap();
        let bytes = BASE64_STANDARD.decode(payload).unwrap();
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "Write-Output 'héllo ✓'");
    }
}
