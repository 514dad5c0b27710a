use colored::{ColoredString, Colorize};

pub struct Colors;

impl Colors {
    // Text
    pub const TEXT: u32 = 0xe6edf3;
    pub const TEXT_MUTED: u32 = 0x8b949e;
    pub const TEXT_SUBTLE: u32 = 0x6e7681;

    // Semantic
    pub const ACCENT: u32 = 0x58a6ff;
    pub const OK: u32 = 0x3fb950;
    pub const WARN: u32 = 0xd29922;
    pub const ERROR: u32 = 0xf85149;

    // Drift
    pub const ADDED: u32 = 0x3fb950;
    pub const REMOVED: u32 = 0xf85149;
}

pub fn paint(text: &str, color: u32) -> ColoredString {
    let [_, r, g, b] = color.to_be_bytes();
    text.truecolor(r, g, b)
}
