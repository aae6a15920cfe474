use std::borrow::Cow;
use std::fmt;

/// Character substituted for a disabled anchor, something very unlikely to match
const DISABLED_ANCHOR: char = '\u{FFFF}';

/// We use that as a way to convey which anchors should be active in regexes.
/// We don't want to enable \A or \G everywhere, it's context dependent:
/// - \A only on the first line of a document
/// - \G only at the position where the current rule began or ended
#[derive(Copy, Clone, PartialEq, Hash, Eq)]
pub enum AnchorActive {
    /// Only \A is active
    A,
    /// Only \G is active
    G,
    /// Both \A and \G are active
    AG,
    /// Neither \A nor \G are active
    None,
}

impl AnchorActive {
    pub fn new(is_first_line: bool, anchor_position: Option<usize>, current_pos: usize) -> Self {
        let g_active = anchor_position == Some(current_pos);

        match (is_first_line, g_active) {
            (true, true) => AnchorActive::AG,
            (true, false) => AnchorActive::A,
            (false, true) => AnchorActive::G,
            (false, false) => AnchorActive::None,
        }
    }

    fn allows_a(self) -> bool {
        matches!(self, AnchorActive::A | AnchorActive::AG)
    }

    fn allows_g(self) -> bool {
        matches!(self, AnchorActive::G | AnchorActive::AG)
    }

    /// This follows vscode-textmate and replaces disabled anchors with something that is
    /// very unlikely to match.
    /// Escaped backslashes are skipped so `\\G` stays a literal backslash followed by `G`.
    pub fn replace_anchors<'a>(&self, pat: &'a str) -> Cow<'a, str> {
        if *self == AnchorActive::AG || !(pat.contains("\\A") || pat.contains("\\G")) {
            return Cow::Borrowed(pat);
        }

        let mut out = String::with_capacity(pat.len());
        let mut chars = pat.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('A') if !self.allows_a() => out.push(DISABLED_ANCHOR),
                Some('G') if !self.allows_g() => out.push(DISABLED_ANCHOR),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        }
        Cow::Owned(out)
    }
}

impl fmt::Debug for AnchorActive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnchorActive::A => "allow_A=true, allow_G=false",
            AnchorActive::G => "allow_A=false, allow_G=true",
            AnchorActive::AG => "allow_A=true, allow_G=true",
            AnchorActive::None => "allow_A=false, allow_G=false",
        };
        f.write_str(s)
    }
}
