mod compiled;
mod font_style;
mod raw;

pub use compiled::{ColorMap, Theme, ThemeProvider, ThemeTrieElementRule};
pub use font_style::FontStyle;
pub use raw::{RawTheme, TokenColorRule, TokenColorSettings};
