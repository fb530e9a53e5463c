/// Storage key for a generated vehicle image: `{make}_{model}_{year}.png`.
///
/// Only make, model and year take part in the key. Color, body type and
/// background never do, so two requests that differ only in color share one
/// cached image.
pub fn cache_key(make: &str, model: &str, year: i32) -> String {
    format!(
        "{}_{}_{}.png",
        clean_segment(make),
        clean_segment(model),
        year
    )
}

fn clean_segment(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "-")
}
