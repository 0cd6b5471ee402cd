/// Strip markdown emphasis/heading characters and surrounding whitespace
/// from a backend answer before it goes to the chat.
///
/// Removes every `#` and `*`, trims each line, then trims the whole text.
/// Applying it twice changes nothing.
pub fn sanitize(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !matches!(c, '#' | '*')).collect();
    stripped
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
