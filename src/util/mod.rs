#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color {
    r: u8,
    g: u8,
    b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
    pub fn as_u32(&self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | (self.b as u32)
    }
    pub fn lerp(&self, other: &Color, factor: f32) -> Color {
        let r = (self.r as f32 + (other.r as f32 - self.r as f32) * factor).round() as u8;
        let g = (self.g as f32 + (other.g as f32 - self.g as f32) * factor).round() as u8;
        let b = (self.b as f32 + (other.b as f32 - self.b as f32) * factor).round() as u8;
        Color { r, g, b }
    }
}

/// Current wall-clock time in milliseconds
#[cfg(target_arch = "wasm32")]
pub fn now_ms() -> f64 {
    js_sys::Date::now()
}

/// Current wall-clock time in milliseconds
#[cfg(not(target_arch = "wasm32"))]
pub fn now_ms() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lerp_hits_both_ends() {
        let a = Color::rgb(0, 10, 200);
        let b = Color::rgb(255, 20, 100);
        assert_eq!(a.lerp(&b, 0.0), a);
        assert_eq!(a.lerp(&b, 1.0), b);
        assert_eq!(a.lerp(&b, 0.5), Color::rgb(128, 15, 150));
    }

    #[test]
    fn packs_as_xrgb() {
        assert_eq!(Color::rgb(0x12, 0x34, 0x56).as_u32(), 0x123456);
    }
}
