use std::ascii;

/// Escapes arbitrary bytes into a printable string for log output.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    let escaped: Vec<u8> =
        input.iter().flat_map(|&c| ascii::escape_default(c)).collect();

    // escape_default only emits ASCII.
    String::from_utf8(escaped).unwrap_or_default()
}
