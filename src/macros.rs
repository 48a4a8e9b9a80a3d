//! The SPF macro-string language: `%{letter[digits][r][delimiters]}`,
//! `%%`, `%_`, `%-`. See RFC 7208 §7.

use std::fmt;

fn starts_with_number(input: &str) -> Result<(Option<u32>, &str), String> {
    let i = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if i == 0 {
        return Ok((None, input));
    }
    let number = input[..i]
        .parse::<u32>()
        .map_err(|err| format!("error parsing digits from '{input}': {err}"))?;
    Ok((Some(number), &input[i..]))
}

#[derive(Debug, Hash, Eq, PartialEq, Copy, Clone)]
pub enum MacroName {
    /// `s` - <sender>
    Sender,
    /// `l` - local-part of <sender>
    LocalPart,
    /// `o` - domain of <sender>
    SenderDomain,
    /// `d` - <domain>
    Domain,
    /// `i` - <ip>, dotted for v4, dotted-nibble for v6
    Ip,
    /// `p` - the validated domain name of <ip>
    ValidatedDomainName,
    /// `v` - `in-addr` for v4, `ip6` for v6
    ReverseDns,
    /// `h` - the HELO/EHLO domain
    HeloDomain,
    /// `c` - explanation-only: the SMTP client IP, human-readable
    ClientIp,
    /// `r` - explanation-only: domain name of the host performing the check
    RelayingHostName,
    /// `t` - explanation-only: the current timestamp
    CurrentUnixTimeStamp,
}

impl MacroName {
    /// Letters legal only within `exp` explanation text (RFC 7208 §8.1).
    fn explanation_only(self) -> bool {
        matches!(
            self,
            Self::ClientIp | Self::RelayingHostName | Self::CurrentUnixTimeStamp
        )
    }

    fn parse(c: char) -> Result<(Self, bool), String> {
        let escape = c.is_ascii_uppercase();
        Ok((
            match c.to_ascii_lowercase() {
                's' => Self::Sender,
                'l' => Self::LocalPart,
                'o' => Self::SenderDomain,
                'd' => Self::Domain,
                'i' => Self::Ip,
                'p' => Self::ValidatedDomainName,
                'v' => Self::ReverseDns,
                'h' => Self::HeloDomain,
                'c' => Self::ClientIp,
                'r' => Self::RelayingHostName,
                't' => Self::CurrentUnixTimeStamp,
                _ => return Err(format!("invalid macro letter '{c}'")),
            },
            escape,
        ))
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Sender => 's',
            Self::LocalPart => 'l',
            Self::SenderDomain => 'o',
            Self::Domain => 'd',
            Self::Ip => 'i',
            Self::ValidatedDomainName => 'p',
            Self::ReverseDns => 'v',
            Self::HeloDomain => 'h',
            Self::ClientIp => 'c',
            Self::RelayingHostName => 'r',
            Self::CurrentUnixTimeStamp => 't',
        }
    }
}

#[derive(Debug)]
pub struct MacroTerm {
    pub name: MacroName,
    /// digits present in the transformer section, keeping only the
    /// rightmost N dot-delimited segments of the expansion
    pub transformer_digits: Option<u32>,
    /// output must be URL-escaped (the macro letter was uppercase)
    pub url_escape: bool,
    /// the `r` transformer was present: reverse the segment order
    pub reverse: bool,
    /// delimiter characters, empty meaning the default `.`
    pub delimiters: String,
}

impl fmt::Display for MacroTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = if self.url_escape {
            self.name.as_char().to_ascii_uppercase()
        } else {
            self.name.as_char()
        };
        write!(f, "%{{{letter}")?;
        if let Some(digits) = self.transformer_digits {
            write!(f, "{digits}")?;
        }
        if self.reverse {
            f.write_str("r")?;
        }
        write!(f, "{}}}", self.delimiters)
    }
}

#[derive(Debug)]
pub enum MacroElement {
    Literal(String),
    Macro(MacroTerm),
}

/// A parsed macro string: a sequence of literal text and macro expansions.
/// Domain-specs, the `redirect` value, and unknown-modifier values are all
/// macro strings.
#[derive(Debug)]
pub struct MacroString {
    pub(crate) elements: Vec<MacroElement>,
}

fn is_macro_literal(c: char) -> bool {
    let c = c as u32;
    (0x21..=0x24).contains(&c) || (0x26..=0x7e).contains(&c)
}

impl MacroString {
    /// Parses `s`. `in_explanation` gates the `c`/`r`/`t` macro letters,
    /// which RFC 7208 restricts to `exp` explanation text; using them
    /// anywhere else is a parse-time error (surfaced by the caller as a
    /// PermError).
    pub fn parse(s: &str, in_explanation: bool) -> Result<Self, String> {
        let mut elements = vec![];

        fn add_literal(elements: &mut Vec<MacroElement>, literal: &str) {
            match elements.last_mut() {
                Some(MacroElement::Literal(prior)) => prior.push_str(literal),
                _ => elements.push(MacroElement::Literal(literal.to_string())),
            }
        }

        let mut s = s;
        while !s.is_empty() {
            if let Some(rest) = s.strip_prefix("%%") {
                add_literal(&mut elements, "%");
                s = rest;
                continue;
            }
            if let Some(rest) = s.strip_prefix("%_") {
                add_literal(&mut elements, " ");
                s = rest;
                continue;
            }
            if let Some(rest) = s.strip_prefix("%-") {
                add_literal(&mut elements, "%20");
                s = rest;
                continue;
            }
            if let Some(rest) = s.strip_prefix("%{") {
                let (name, url_escape) = MacroName::parse(
                    rest.chars()
                        .next()
                        .ok_or_else(|| format!("unexpected end of input in '{s}'"))?,
                )?;

                if name.explanation_only() && !in_explanation {
                    return Err(format!(
                        "macro letter '{}' is only legal in explanation text",
                        name.as_char()
                    ));
                }

                let after_letter = &rest[1..];
                let (remain, transformer_digits) = match starts_with_number(after_letter) {
                    Ok((n, r)) => (r, n),
                    Err(err) => return Err(err),
                };

                let (reverse, remain) = match remain.strip_prefix('r') {
                    Some(r) => (true, r),
                    None => (false, remain),
                };

                let (delimiters, remain) = remain
                    .split_once('}')
                    .ok_or_else(|| format!("expected '}}' to close macro in '{s}'"))?;

                elements.push(MacroElement::Macro(MacroTerm {
                    name,
                    transformer_digits,
                    reverse,
                    url_escape,
                    delimiters: delimiters.to_string(),
                }));

                s = remain;
                continue;
            }

            if s.starts_with('%') {
                return Err(format!("dangling '%' in '{s}'"));
            }

            let c = s.chars().next().unwrap();
            if !is_macro_literal(c) {
                return Err(format!("invalid macro-literal character '{c}' in '{s}'"));
            }
            add_literal(&mut elements, &s[0..c.len_utf8()]);
            s = &s[c.len_utf8()..];
        }

        Ok(Self { elements })
    }
}

impl fmt::Display for MacroString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.elements {
            match element {
                MacroElement::Literal(lit) => f.write_str(lit)?,
                MacroElement::Macro(term) => write!(f, "{term}")?,
            }
        }
        Ok(())
    }
}
