use std::fmt;

/// Display geometry requested through metadata as `<w>x<h>x<depth>x<dpi>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayProperties {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub dpi: u32,
}

impl Default for DisplayProperties {
    fn default() -> Self {
        Self {
            width: 800,
            height: 1280,
            depth: 32,
            dpi: 160,
        }
    }
}

impl DisplayProperties {
    /// Parses `<w>x<h>x<depth>x<dpi>`; every field must be a positive integer.
    pub fn parse(value: &str) -> Option<Self> {
        let mut fields = value.trim().split('x').map(|f| f.parse::<u32>().ok().filter(|v| *v > 0));
        let width = fields.next()??;
        let height = fields.next()??;
        let depth = fields.next()??;
        let dpi = fields.next()??;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            width,
            height,
            depth,
            dpi,
        })
    }

    /// Value of the headless display property.
    pub fn config(&self) -> String {
        format!("{}x{}x{}", self.width, self.height, self.depth)
    }
}

impl fmt::Display for DisplayProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.config(), self.dpi)
    }
}
