//! Redis-style glob matching for cache key scans.
//!
//! Supports `*` (any run), `?` (any single char) and `\x` (literal `x`).
//! Character classes are not supported; [`escape`] neutralizes `[`/`]` anyway.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Star,
    One,
    Lit(char),
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => tokens.push(Token::Star),
            '?' => tokens.push(Token::One),
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(Token::Lit(escaped)),
                None => tokens.push(Token::Lit('\\')),
            },
            other => tokens.push(Token::Lit(other)),
        }
    }
    tokens
}

pub fn glob_match(pattern: &str, value: &str) -> bool {
    let tokens = tokenize(pattern);
    let chars: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0usize, 0usize);
    let (mut star, mut mark) = (None, 0usize);

    while v < chars.len() {
        match tokens.get(p) {
            Some(Token::Star) => {
                star = Some(p);
                mark = v;
                p += 1;
                continue;
            }
            Some(Token::One) => {
                p += 1;
                v += 1;
                continue;
            }
            Some(Token::Lit(c)) if *c == chars[v] => {
                p += 1;
                v += 1;
                continue;
            }
            _ => {}
        }

        if let Some(s) = star {
            p = s + 1;
            mark += 1;
            v = mark;
            continue;
        }

        return false;
    }

    while matches!(tokens.get(p), Some(Token::Star)) {
        p += 1;
    }

    p == tokens.len()
}

/// Escape glob metacharacters so `segment` only matches itself.
pub fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_spans_segments() {
        assert!(glob_match("authz:decision:7:*:alice:*", "authz:decision:7:cms:alice:/docs/1:write"));
        assert!(!glob_match("authz:decision:7:*:alice:*", "authz:decision:8:cms:alice:/docs/1:write"));
    }

    #[test]
    fn question_mark_matches_one() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
    }

    #[test]
    fn escaped_metacharacters_are_literal() {
        let pattern = format!("roles:{}", escape("we*rd?"));
        assert!(glob_match(&pattern, "roles:we*rd?"));
        assert!(!glob_match(&pattern, "roles:weXXrdY"));
    }

    #[test]
    fn backtracks() {
        assert!(glob_match("*:read", "cache:payments:read"));
        assert!(!glob_match("*:read", "cache:payments:write"));
        assert!(glob_match("*", ""));
    }
}
