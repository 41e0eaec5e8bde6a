//! Known Grok models and their context limits.

/// Model used when nothing else is configured.
pub const DEFAULT_GROK_MODEL: &str = "grok-4-0709";

/// Lower-tier model the session falls back to after a quota rejection.
pub const DEFAULT_GROK_FLASH_MODEL: &str = "grok-3-fast";

/// Catalog of models offered to users, with a short description.
pub const GROK_MODELS: &[(&str, &str)] = &[
    (
        "grok-4-0709",
        "Flagship model for advanced reasoning, text, and vision (256K context)",
    ),
    ("grok-3", "General-purpose text model (131K context)"),
    ("grok-3-mini", "Lightweight variant for faster responses"),
    ("grok-3-fast", "Fast response model"),
    ("grok-2-vision-1212", "Vision-capable model"),
];

/// Context window of the `grok-4` family.
const GROK_4_TOKEN_LIMIT: u32 = 256_000;

/// Context window of every other model.
const DEFAULT_TOKEN_LIMIT: u32 = 131_072;

/// Context window, in tokens, for a model id.
pub fn token_limit(model: &str) -> u32 {
    if model.starts_with("grok-4") {
        GROK_4_TOKEN_LIMIT
    } else {
        DEFAULT_TOKEN_LIMIT
    }
}

/// Catalog description of a model, if it is a known one.
pub fn describe_model(model: &str) -> Option<&'static str> {
    GROK_MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, description)| *description)
}
