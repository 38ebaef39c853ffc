//! Represents command/path templates with embedded variable references,
//! e.g. `cc $in -o $out`, and mechanisms for expanding those into plain
//! strings.

use crate::scanner::{ParseResult, Scanner};
use crate::smallmap::SmallMap;
use anyhow::bail;
use std::borrow::Cow;
use std::path::Path;

/// An environment providing a mapping of variable name to variable value.
/// A given EvalString may be expanded with multiple environments as possible
/// context.
pub trait Env {
    fn get_var(&self, var: &str) -> Option<Cow<str>>;
}

/// One token within an EvalString, either literal text or a variable
/// reference.
#[derive(Debug, PartialEq)]
pub enum EvalPart<T: AsRef<str>> {
    Literal(T),
    VarRef(T),
}

/// A parsed but unexpanded variable-reference string, e.g. "cc $in -o $out".
#[derive(Debug)]
pub struct EvalString<T: AsRef<str>>(Vec<EvalPart<T>>);

impl<T: AsRef<str>> EvalString<T> {
    /// Expand against a stack of environments; the first one that knows a
    /// variable wins, and unknown variables expand to nothing.
    pub fn evaluate(&self, envs: &[&dyn Env]) -> String {
        let mut val = String::new();
        for part in &self.0 {
            match part {
                EvalPart::Literal(s) => val.push_str(s.as_ref()),
                EvalPart::VarRef(v) => {
                    for env in envs {
                        if let Some(v) = env.get_var(v.as_ref()) {
                            val.push_str(&v);
                            break;
                        }
                    }
                }
            }
        }
        val
    }
}

impl EvalString<String> {
    /// Parse template syntax: `$$` is a literal dollar, `$name` and
    /// `${name}` are variable references, and anything else is literal
    /// text.  Adjacent literals are merged as they are scanned.
    pub fn parse(text: &str) -> anyhow::Result<EvalString<String>> {
        let mut buf = text.as_bytes().to_vec();
        buf.push(0);
        let mut scanner = Scanner::new(&buf);
        match parse_parts(&mut scanner) {
            Ok(parts) => Ok(EvalString(parts)),
            Err(err) => bail!(scanner.format_parse_error(Path::new("<template>"), err)),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_')
}

fn parse_parts(scanner: &mut Scanner) -> ParseResult<Vec<EvalPart<String>>> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    loop {
        match scanner.read() {
            '\0' => break,
            '$' => match scanner.read() {
                '$' => literal.push('$'),
                '{' => {
                    if !literal.is_empty() {
                        parts.push(EvalPart::Literal(std::mem::take(&mut literal)));
                    }
                    let start = scanner.ofs;
                    loop {
                        match scanner.read() {
                            '}' => break,
                            '\0' => {
                                scanner.back();
                                return scanner.parse_error("unterminated ${...} reference");
                            }
                            _ => {}
                        }
                    }
                    let name = scanner.slice(start, scanner.ofs - 1);
                    if name.is_empty() {
                        return scanner.parse_error("empty variable reference");
                    }
                    parts.push(EvalPart::VarRef(name.to_owned()));
                }
                '\0' => {
                    scanner.back();
                    return scanner.parse_error("expected variable name after '$'");
                }
                c if is_ident_char(c) => {
                    if !literal.is_empty() {
                        parts.push(EvalPart::Literal(std::mem::take(&mut literal)));
                    }
                    let start = scanner.ofs - 1;
                    while is_ident_char(scanner.peek()) {
                        scanner.next();
                    }
                    parts.push(EvalPart::VarRef(scanner.slice(start, scanner.ofs).to_owned()));
                }
                _ => {
                    scanner.back();
                    return scanner.parse_error("bad '$' escape");
                }
            },
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        parts.push(EvalPart::Literal(literal));
    }
    Ok(parts)
}

/// A single scope's worth of variable definitions.
#[derive(Debug, Default)]
pub struct Vars<'text>(SmallMap<&'text str, String>);

impl<'text> Vars<'text> {
    pub fn insert(&mut self, key: &'text str, val: String) {
        self.0.insert(key, val);
    }
    pub fn get(&self, key: &'text str) -> Option<&String> {
        self.0.get(key)
    }
}

impl<'text> Env for Vars<'text> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.0.get(var).map(|val| Cow::Borrowed(val.as_str()))
    }
}

// Impl for the variables attached to an edge.
impl Env for SmallMap<String, String> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.get(var).map(|val| Cow::Borrowed(val.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text() {
        let s = EvalString::parse("plain text").unwrap();
        assert_eq!(s.evaluate(&[]), "plain text");
    }

    #[test]
    fn one_variable() {
        let s = EvalString::parse("hi $var").unwrap();
        assert_eq!(s.evaluate(&[]), "hi ");
        let mut vars = Vars::default();
        vars.insert("var", "there".to_owned());
        assert_eq!(s.evaluate(&[&vars]), "hi there");
    }

    #[test]
    fn braces_and_suffix() {
        let s = EvalString::parse("-o ${out}.d").unwrap();
        let mut vars = Vars::default();
        vars.insert("out", "foo.o".to_owned());
        assert_eq!(s.evaluate(&[&vars]), "-o foo.o.d");
    }

    #[test]
    fn dollar_dollar() {
        // A `$$` is the only dollar that round-trips as literal text.
        let s = EvalString::parse("cost: $$5").unwrap();
        assert_eq!(s.evaluate(&[]), "cost: $5");
    }

    #[test]
    fn env_stack_first_wins() {
        let s = EvalString::parse("$var").unwrap();
        let mut inner = Vars::default();
        inner.insert("var", "inner".to_owned());
        let mut outer = Vars::default();
        outer.insert("var", "outer".to_owned());
        assert_eq!(s.evaluate(&[&inner, &outer]), "inner");
    }

    #[test]
    fn trailing_dollar_is_error() {
        let err = EvalString::parse("oops$").unwrap_err();
        assert!(err.to_string().contains("expected variable name"));
    }

    #[test]
    fn unterminated_brace_is_error() {
        assert!(EvalString::parse("${name").is_err());
    }

    #[test]
    fn bad_escape_is_error() {
        assert!(EvalString::parse("100$%").is_err());
    }
}
