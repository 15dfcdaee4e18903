// Color schemes for dye injection. Palettes are authored as HSLA
// strings and converted to RGB once, when a scheme is selected.

use rand::Rng;

// Dye values are kept well below 1.0 so the bloom threshold stays
// meaningful; matches the splat color range of the reference pipeline.
pub const SPLAT_COLOR_SCALE: f32 = 0.15;

const DEFAULT_SCHEME: &str = "default";

const SCHEMES: &[(&str, &[&str])] = &[
    (
        "default",
        &[
            "hsla(0, 100%, 50%, 1)",
            "hsla(40, 100%, 50%, 1)",
            "hsla(80, 100%, 50%, 1)",
            "hsla(120, 100%, 50%, 1)",
            "hsla(160, 100%, 50%, 1)",
            "hsla(200, 100%, 50%, 1)",
            "hsla(240, 100%, 50%, 1)",
            "hsla(280, 100%, 50%, 1)",
            "hsla(320, 100%, 50%, 1)",
        ],
    ),
    (
        "sunset",
        &[
            "hsla(4, 96%, 55%, 1)",
            "hsla(18, 95%, 55%, 1)",
            "hsla(33, 96%, 52%, 1)",
            "hsla(45, 97%, 55%, 1)",
            "hsla(330, 85%, 55%, 1)",
            "hsla(295, 70%, 50%, 1)",
        ],
    ),
    (
        "ocean",
        &[
            "hsla(175, 90%, 45%, 1)",
            "hsla(190, 95%, 50%, 1)",
            "hsla(205, 95%, 55%, 1)",
            "hsla(220, 90%, 58%, 1)",
            "hsla(240, 80%, 60%, 1)",
            "hsla(160, 85%, 45%, 1)",
        ],
    ),
    (
        "neon",
        &[
            "hsla(300, 100%, 50%, 1)",
            "hsla(180, 100%, 50%, 1)",
            "hsla(90, 100%, 50%, 1)",
            "hsla(60, 100%, 50%, 1)",
            "hsla(330, 100%, 55%, 1)",
        ],
    ),
    (
        "ember",
        &[
            "hsla(0, 90%, 40%, 1)",
            "hsla(12, 92%, 45%, 1)",
            "hsla(25, 95%, 48%, 1)",
            "hsla(38, 95%, 50%, 1)",
            "hsla(50, 90%, 52%, 1)",
        ],
    ),
    (
        "mono",
        &[
            "hsla(0, 0%, 95%, 1)",
            "hsla(0, 0%, 75%, 1)",
            "hsla(0, 0%, 55%, 1)",
            "hsla(0, 0%, 35%, 1)",
        ],
    ),
];

pub fn scheme_names() -> Vec<&'static str> {
    SCHEMES.iter().map(|(name, _)| *name).collect()
}

// Standard hue-sector conversion. h in degrees, s and l in 0..1.
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> [f32; 3] {
    let h = h.rem_euclid(360.0);
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let x = c * (1.0 - ((h / 60.0).rem_euclid(2.0) - 1.0).abs());
    let m = l - c / 2.0;
    let (r, g, b) = match (h / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [r + m, g + m, b + m]
}

// Accepts "hsl(h, s%, l%)" and "hsla(h, s%, l%, a)"; the alpha channel
// is dropped, palettes are opaque by construction.
pub fn parse_hsla(text: &str) -> Option<[f32; 3]> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("hsla(")
        .or_else(|| trimmed.strip_prefix("hsl("))?
        .strip_suffix(')')?;
    let mut parts = body.split(',').map(str::trim);

    let h: f32 = parts.next()?.parse().ok()?;
    let s: f32 = parts.next()?.strip_suffix('%')?.parse().ok()?;
    let l: f32 = parts.next()?.strip_suffix('%')?.parse().ok()?;
    // Optional alpha; must at least parse if present.
    if let Some(alpha) = parts.next() {
        let _: f32 = alpha.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(hsl_to_rgb(h, s / 100.0, l / 100.0))
}

fn convert_palette(name: &str, entries: &[&str]) -> Vec<[f32; 3]> {
    let mut colors = Vec::with_capacity(entries.len());
    for entry in entries {
        match parse_hsla(entry) {
            Some(color) => colors.push(color),
            None => eprintln!("Scheme '{}': skipping malformed color '{}'", name, entry),
        }
    }
    colors
}

pub struct SchemeManager {
    active_name: String,
    palette: Vec<[f32; 3]>,
}

impl SchemeManager {
    pub fn new(initial: &str) -> Self {
        let mut manager = Self {
            active_name: String::new(),
            palette: Vec::new(),
        };
        manager.set_scheme(initial);
        manager
    }

    // Unknown names fall back to the default scheme with a warning;
    // scheme selection never fails.
    pub fn set_scheme(&mut self, name: &str) {
        let entry = SCHEMES.iter().find(|(scheme, _)| *scheme == name);
        let (resolved, colors) = match entry {
            Some((scheme, colors)) => (*scheme, *colors),
            None => {
                eprintln!("Unknown color scheme '{}', using '{}'", name, DEFAULT_SCHEME);
                let (scheme, colors) = SCHEMES
                    .iter()
                    .find(|(scheme, _)| *scheme == DEFAULT_SCHEME)
                    .copied()
                    .unwrap_or((DEFAULT_SCHEME, &[]));
                (scheme, colors)
            }
        };
        self.active_name = resolved.to_string();
        self.palette = convert_palette(resolved, colors);
    }

    pub fn active_name(&self) -> &str {
        &self.active_name
    }

    pub fn palette(&self) -> &[[f32; 3]] {
        &self.palette
    }

    // Next scheme in declaration order, wrapping around.
    pub fn cycle(&mut self) {
        let names = scheme_names();
        let current = names
            .iter()
            .position(|name| *name == self.active_name)
            .unwrap_or(0);
        let next = names[(current + 1) % names.len()];
        self.set_scheme(next);
    }

    pub fn random_color<R: Rng>(&self, rng: &mut R) -> [f32; 3] {
        let base = if self.palette.is_empty() {
            [1.0, 1.0, 1.0]
        } else {
            self.palette[rng.gen_range(0..self.palette.len())]
        };
        [
            base[0] * SPLAT_COLOR_SCALE,
            base[1] * SPLAT_COLOR_SCALE,
            base[2] * SPLAT_COLOR_SCALE,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_rgb_close(actual: [f32; 3], expected: [f32; 3]) {
        for i in 0..3 {
            assert!(
                (actual[i] - expected[i]).abs() < 1e-5,
                "channel {} differs: {:?} vs {:?}",
                i,
                actual,
                expected
            );
        }
    }

    #[test]
    fn test_hsl_primary_colors() {
        assert_rgb_close(hsl_to_rgb(0.0, 1.0, 0.5), [1.0, 0.0, 0.0]);
        assert_rgb_close(hsl_to_rgb(120.0, 1.0, 0.5), [0.0, 1.0, 0.0]);
        assert_rgb_close(hsl_to_rgb(240.0, 1.0, 0.5), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_hsl_zero_saturation_is_grey() {
        assert_rgb_close(hsl_to_rgb(217.0, 0.0, 0.3), [0.3, 0.3, 0.3]);
    }

    #[test]
    fn test_hsl_hue_wraps() {
        assert_rgb_close(hsl_to_rgb(360.0, 1.0, 0.5), hsl_to_rgb(0.0, 1.0, 0.5));
        assert_rgb_close(hsl_to_rgb(-120.0, 1.0, 0.5), hsl_to_rgb(240.0, 1.0, 0.5));
    }

    #[test]
    fn test_parse_hsla_variants() {
        assert!(parse_hsla("hsla(200, 95%, 50%, 1)").is_some());
        assert!(parse_hsla("hsl(200, 95%, 50%)").is_some());
        assert!(parse_hsla("  hsla(0, 100%, 50%, 0.5)  ").is_some());
        assert_rgb_close(
            parse_hsla("hsla(0, 100%, 50%, 1)").unwrap(),
            [1.0, 0.0, 0.0],
        );
    }

    #[test]
    fn test_parse_hsla_rejects_malformed() {
        assert!(parse_hsla("rgb(1, 2, 3)").is_none());
        assert!(parse_hsla("hsla(200, 95, 50, 1)").is_none(), "missing percent signs");
        assert!(parse_hsla("hsla(200, 95%)").is_none(), "too few components");
        assert!(parse_hsla("hsla(200, 95%, 50%, 1, 9)").is_none(), "too many components");
        assert!(parse_hsla("hsla(abc, 95%, 50%, 1)").is_none());
    }

    #[test]
    fn test_all_builtin_palettes_convert() {
        for (name, entries) in SCHEMES {
            let colors = convert_palette(name, entries);
            assert_eq!(
                colors.len(),
                entries.len(),
                "scheme '{}' has malformed entries",
                name
            );
        }
    }

    #[test]
    fn test_unknown_scheme_falls_back_to_default() {
        let mut manager = SchemeManager::new("default");
        let default_palette = manager.palette().to_vec();
        manager.set_scheme("nonexistent");
        assert_eq!(manager.active_name(), "default");
        assert_eq!(manager.palette(), &default_palette[..]);
    }

    #[test]
    fn test_random_color_comes_from_palette() {
        let manager = SchemeManager::new("mono");
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let color = manager.random_color(&mut rng);
            let found = manager.palette().iter().any(|base| {
                (0..3).all(|i| (base[i] * SPLAT_COLOR_SCALE - color[i]).abs() < 1e-6)
            });
            assert!(found, "drawn color {:?} not in active palette", color);
        }
    }

    #[test]
    fn test_cycle_visits_every_scheme_and_wraps() {
        let mut manager = SchemeManager::new("default");
        let names = scheme_names();
        for expected in names.iter().skip(1) {
            manager.cycle();
            assert_eq!(manager.active_name(), *expected);
        }
        manager.cycle();
        assert_eq!(manager.active_name(), "default", "cycle should wrap");
    }
}
