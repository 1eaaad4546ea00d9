//! Command-line message payloads and reply formatting

use anyhow::{Result, anyhow};

/// Parse hex bytes such as `"01 0a ff"`, `"0x01,0x0A"` or `"010aff"`
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let tokens: Vec<&str> = input
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .filter(|t| !t.is_empty())
        .collect();

    let mut bytes = Vec::new();
    for token in tokens {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        let odd_packed = digits.len() > 2 && digits.len() % 2 != 0;
        if digits.is_empty() || odd_packed {
            return Err(anyhow!("Invalid hex byte '{}'", token));
        }

        if digits.len() <= 2 {
            bytes.push(parse_byte(digits, token)?);
        } else {
            for pair in digits.as_bytes().chunks(2) {
                let pair = std::str::from_utf8(pair).map_err(|_| anyhow!("Invalid hex '{}'", token))?;
                bytes.push(parse_byte(pair, token)?);
            }
        }
    }
    Ok(bytes)
}

fn parse_byte(digits: &str, token: &str) -> Result<u8> {
    u8::from_str_radix(digits, 16).map_err(|_| anyhow!("Invalid hex byte '{}'", token))
}

/// Render bytes as space separated lowercase hex
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
