//! xname parsing
//!
//! An xname encodes physical location as alternating letter/number segments,
//! e.g. `x3000c0s19b1n0` is node 0 behind BMC 1 in slot 19 of chassis 0 in
//! cabinet 3000. Parsing normalises leading zeros and lowercases.

use serde::{Deserialize, Serialize};

/// Coarse classification by segment pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XNameKind {
    Cabinet,
    Chassis,
    ChassisBmc,
    ComputeModule,
    NodeBmc,
    Node,
    Processor,
    RouterModule,
    RouterBmc,
    Other,
}

/// Parsed xname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XName {
    segments: Vec<(char, u32)>,
}

impl XName {
    pub fn parse(s: &str) -> Result<Self, String> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return Err("empty".to_string());
        }

        let mut segments = Vec::new();
        let mut chars = lowered.chars().peekable();
        while let Some(letter) = chars.next() {
            if !letter.is_ascii_lowercase() {
                return Err(format!("unexpected '{}'", letter));
            }
            let mut digits = String::new();
            while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit()) {
                digits.push(c);
                chars.next();
            }
            if digits.is_empty() {
                return Err(format!("segment '{}' has no ordinal", letter));
            }
            let ordinal = digits
                .parse::<u32>()
                .map_err(|e| format!("segment '{}{}': {}", letter, digits, e))?;
            segments.push((letter, ordinal));
        }

        match segments.first() {
            Some(('x', _)) | Some(('d', _)) => Ok(Self { segments }),
            _ => Err("must start with a cabinet ('x') or CDU ('d') segment".to_string()),
        }
    }

    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    pub fn kind(&self) -> XNameKind {
        let pattern: String = self.segments.iter().map(|(c, _)| *c).collect();
        match pattern.as_str() {
            "x" => XNameKind::Cabinet,
            "xc" => XNameKind::Chassis,
            "xcb" => XNameKind::ChassisBmc,
            "xcs" => XNameKind::ComputeModule,
            "xcsb" => XNameKind::NodeBmc,
            "xcsbn" => XNameKind::Node,
            "xcsbnp" => XNameKind::Processor,
            "xcr" => XNameKind::RouterModule,
            "xcrb" => XNameKind::RouterBmc,
            _ => XNameKind::Other,
        }
    }

    /// Enclosing component, if any.
    pub fn parent(&self) -> Option<XName> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(XName {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl std::fmt::Display for XName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (letter, ordinal) in &self.segments {
            write!(f, "{}{}", letter, ordinal)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for XName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Normalised form of `s`, or `s` unchanged when it is not an xname.
pub fn normalize(s: &str) -> String {
    XName::parse(s)
        .map(|x| x.to_string())
        .unwrap_or_else(|_| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_normalize() {
        let x = XName::parse("X3000C0S019B1N0").unwrap();
        assert_eq!(x.to_string(), "x3000c0s19b1n0");
        assert_eq!(x.kind(), XNameKind::Node);
        assert_eq!(x.depth(), 5);
        assert_eq!(normalize("x0001c0"), "x1c0");
        assert_eq!(normalize("not an xname"), "not an xname");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(XName::parse("x0").unwrap().kind(), XNameKind::Cabinet);
        assert_eq!(XName::parse("x0c0s0b0").unwrap().kind(), XNameKind::NodeBmc);
        assert_eq!(XName::parse("x0c0r3b0").unwrap().kind(), XNameKind::RouterBmc);
        assert_eq!(XName::parse("x0c0s0b0n0p1").unwrap().kind(), XNameKind::Processor);
        assert_eq!(XName::parse("d0w1").unwrap().kind(), XNameKind::Other);
    }

    #[test]
    fn test_parent() {
        let node = XName::parse("x0c0s0b0n0").unwrap();
        assert_eq!(node.parent().unwrap().to_string(), "x0c0s0b0");
        assert!(XName::parse("x1").unwrap().parent().is_none());
    }

    #[test]
    fn test_invalid() {
        assert!(!XName::is_valid(""));
        assert!(!XName::is_valid("c0s0"));
        assert!(!XName::is_valid("x0c"));
        assert!(!XName::is_valid("x0-c0"));
        assert!(!XName::is_valid("x99999999999"));
    }
}
