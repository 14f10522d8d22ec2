// Strips terminal control sequences that move or erase, keeping SGR
// color/style sequences intact. Raw carriage returns are dropped as well:
// pipe-backed checks log discrete chunks, so overwrite semantics reduce to
// removing the rewrite machinery.
pub fn sanitize_chunk(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '\r' {
            i += 1;
            continue;
        }
        if ch == '\u{1b}' {
            if i + 1 >= chars.len() {
                break;
            }
            match chars[i + 1] {
                '[' => {
                    let start = i;
                    i += 2;
                    while i < chars.len() {
                        let final_byte = chars[i];
                        if ('@'..='~').contains(&final_byte) {
                            if final_byte == 'm' {
                                out.extend(chars[start..=i].iter());
                            }
                            break;
                        }
                        i += 1;
                    }
                }
                ']' => {
                    i += 2;
                    while i < chars.len() {
                        if chars[i] == '\u{0007}' {
                            break;
                        }
                        if chars[i] == '\u{1b}' && i + 1 < chars.len() && chars[i + 1] == '\\' {
                            i += 1;
                            break;
                        }
                        i += 1;
                    }
                }
                _ => {
                    // two-byte sequences: keyboard/charset/mode toggles
                    i += 1;
                }
            }
            i += 1;
            continue;
        }
        out.push(ch);
        i += 1;
    }
    out
}
