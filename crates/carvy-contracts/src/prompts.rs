//! Studio prompt template for vehicle renders.
//!
//! The directive block is fixed text. Only the background/floor color is
//! substituted, so any wording change must bump
//! [`STUDIO_PROMPT_TEMPLATE_VERSION`].

use crate::requests::VehicleImageRequest;

pub const STUDIO_PROMPT_TEMPLATE_VERSION: u32 = 1;

pub const DEFAULT_BACKGROUND: &str = "clean, solid light-gray";

const STUDIO_DIRECTIVES: [&str; 8] = [
    "4. LIGHTING: Soft studio lighting. Evenly lit. High contrast.",
    "5. WINDOWS: PURE SOLID BLACK OPAQUE (Limo Tint). NO TRANSPARENCY inside the car. NO REFLECTIONS on windows.",
    "6. REFLECTIONS: Minimize floor reflections.",
    "7. VIEW: 3/4 Front View.",
    "8. QUALITY: 4k, Sharp edges.",
    "9. Asegúrate de que los rines son los originales que trae el auto de agencia.",
    "10. El auto debe de abarcar el 90% del ancho de la imagen.",
    "11. No debe de reflejarse el auto en el suelo.",
];

const STUDIO_GOAL: &str = "GOAL: Ensure high contrast between subject and background.";

pub fn build_studio_prompt(request: &VehicleImageRequest) -> String {
    let mut prompt = format!(
        "Generate a photorealistic image of a {} {} {}",
        request.make, request.model, request.year
    );
    if let Some(color) = request.color() {
        prompt.push_str(&format!(", color {color}"));
    }
    if let Some(body_type) = request.body_type() {
        prompt.push_str(&format!(", type {body_type}"));
    }
    prompt.push_str(".\n\nCRITICAL STUDIO SETUP:\n");

    let background = request
        .background_color_name()
        .unwrap_or(DEFAULT_BACKGROUND);
    prompt.push_str(&format!("1. BACKGROUND: {background}\n"));
    prompt.push_str(&format!("2. FLOOR: {background}\n"));
    prompt.push_str(&format!(
        "3. SHADOWS: NO CAST SHADOWS. The car must appear to be FLOATING in a {background} void. Do not render shadow contact on the floor.\n"
    ));
    for directive in STUDIO_DIRECTIVES {
        prompt.push_str(directive);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(STUDIO_GOAL);
    prompt
}
