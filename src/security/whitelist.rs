//! Action whitelist.
//!
//! Masks are globs over dotted action names: `*` matches within one name segment,
//! `**` across segments, `?` a single character.
//!
//! | Mask        | `math.add` | `math.v2.add` | `users.get` |
//! |-------------|------------|---------------|-------------|
//! | `math.*`    | yes        | no            | no          |
//! | `math.**`   | yes        | yes           | no          |
//! | `*.get`     | no         | no            | yes         |

use regex::Regex;

/// Compiled whitelist masks.
#[derive(Debug, Clone)]
pub struct Whitelist {
    masks: Vec<Regex>,
}

impl Whitelist {
    /// # Errors
    ///
    /// Fails if a mask cannot be compiled.
    pub fn new<S: AsRef<str>>(masks: &[S]) -> Result<Self, regex::Error> {
        let masks = masks
            .iter()
            .map(|mask| Regex::new(&mask_to_regex(mask.as_ref())))
            .collect::<Result<_, _>>()?;
        Ok(Self { masks })
    }

    /// Returns `true` when `action` matches at least one mask.
    pub fn allows(&self, action: &str) -> bool {
        self.masks.iter().any(|mask| mask.is_match(action))
    }
}

fn mask_to_regex(mask: &str) -> String {
    let mut source = String::from("^");
    let mut chars = mask.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                source.push_str(".*");
            }
            '*' => source.push_str("[^.]*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    source
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_wildcard() {
        let list = Whitelist::new(&["math.*"]).unwrap();
        assert!(list.allows("math.add"));
        assert!(list.allows("math.test"));
        assert!(!list.allows("math.v2.add"));
        assert!(!list.allows("mathematics.add"));
        assert!(!list.allows("users.get"));
    }

    #[test]
    fn multi_segment_wildcard() {
        let list = Whitelist::new(&["math.**"]).unwrap();
        assert!(list.allows("math.v2.add"));
        assert!(!list.allows("users.get"));
    }

    #[test]
    fn any_mask_may_match() {
        let list = Whitelist::new(&["math.add", "*.get", "$node.?ist"]).unwrap();
        assert!(list.allows("math.add"));
        assert!(list.allows("users.get"));
        assert!(list.allows("$node.list"));
        assert!(!list.allows("math.sub"));
    }

    #[test]
    fn empty_whitelist_allows_nothing() {
        let list = Whitelist::new::<&str>(&[]).unwrap();
        assert!(!list.allows("math.add"));
    }
}
