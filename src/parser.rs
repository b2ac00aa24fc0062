//! implements a parser for the client side of the beanstalkd TCP protocol:
//! the reply lines a server sends back.
use std::fmt;

use crate::types::protocol::Reply;

/// A reply line that doesn't fit the reply grammar.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BadFormat;

impl fmt::Display for BadFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("bad format")
    }
}

/// True if the server would accept this as a tube name: up to 200 bytes
/// drawn from a restricted ASCII set, not starting with a hyphen.
pub(crate) fn is_valid_tube_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 200
        && name
            .bytes()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(c, i == 0))
}

fn char_is_name_safe(c: u8, is_first: bool) -> bool {
    match c {
        b'a'..=b'z' => true,
        b'A'..=b'Z' => true,
        b'0'..=b'9' => true,
        b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
        b'-' => !is_first, // - is only name safe outside first position
        _ => false,
    }
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// No more input to consume.
    fn is_done(&self) -> bool {
        self.from.is_empty()
    }

    /// Asserts there's no more input to take, returning `result` if so, and
    /// a `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, BadFormat> {
        if self.is_done() {
            Ok(result)
        } else {
            Err(BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], BadFormat> {
        let token = self.next_token().ok_or(BadFormat)?;

        if token.is_empty() {
            Err(BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting a space then a decimal u64,
    /// rejecting overflow.
    fn expect_next_u64(&mut self) -> Result<u64, BadFormat> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u64;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(BadFormat)?
                        .checked_add((*v - b'0') as u64)
                        .ok_or(BadFormat)?
                },
                _ => return Err(BadFormat),
            };
        }

        Ok(r)
    }

    /// As `expect_next_u64`, narrowed to u32.
    fn expect_next_u32(&mut self) -> Result<u32, BadFormat> {
        self.expect_next_u64()?.try_into().map_err(|_| BadFormat)
    }

    /// As `expect_next_u64`, narrowed to a byte count.
    fn expect_next_usize(&mut self) -> Result<usize, BadFormat> {
        self.expect_next_u64()?.try_into().map_err(|_| BadFormat)
    }

    /// Consumes from the input, expecting a space then a tube name.
    fn expect_next_name(&mut self) -> Result<String, BadFormat> {
        self.expect_space()?;

        let token = self.expect_next_token()?;
        let name =
            String::from_utf8(token.to_vec()).map_err(|_| BadFormat)?;

        if is_valid_tube_name(&name) {
            Ok(name)
        } else {
            Err(BadFormat)
        }
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), BadFormat> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(BadFormat),
        }
    }

    /// Consumes until reaching a space byte or the end of the input. It
    /// returns None at the end of the input. On consecutive space bytes, it
    /// returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for Reply {
    type Error = BadFormat;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use Reply::*;

        let mut ps: ParseState = value.into();

        let word = ps.expect_next_token()?.to_vec();

        let reply = match &word[..] {
            b"INSERTED" => Inserted {
                id: ps.expect_next_u64()?,
            },
            // BURIED answers put (with an id) and bury (without one).
            b"BURIED" => Buried {
                id: if ps.is_done() {
                    None
                } else {
                    Some(ps.expect_next_u64()?)
                },
            },
            b"RESERVED" => Reserved {
                id: ps.expect_next_u64()?,
                n_bytes: ps.expect_next_usize()?,
            },
            b"FOUND" => Found {
                id: ps.expect_next_u64()?,
                n_bytes: ps.expect_next_usize()?,
            },
            b"OK" => OkData {
                n_bytes: ps.expect_next_usize()?,
            },
            b"USING" => Using {
                tube: ps.expect_next_name()?,
            },
            b"WATCHING" => Watching {
                count: ps.expect_next_u32()?,
            },
            b"DELETED" => Deleted,
            b"RELEASED" => Released,
            b"NOT_FOUND" => NotFound,
            b"DRAINING" => Draining,

            // Any other word is kept whole, arguments included, so the
            // error classifier can report the full line.
            _ => {
                return Ok(Other {
                    word: String::from_utf8_lossy(&word).into_owned(),
                    line: String::from_utf8_lossy(value).into_owned(),
                })
            },
        };

        ps.expect_done_and(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        use Reply::*;

        const U32_MAX_PLUS_1: u128 = (u32::MAX as u128) + 1;
        const U64_MAX_PLUS_1: u128 = (u64::MAX as u128) + 1;

        // Asserts the line parses into the given reply successfully.
        #[track_caller]
        fn ok(line: &[u8], res: Reply) {
            assert_eq!(line.try_into(), Ok(res));
        }

        // Asserts the line fails to parse.
        #[track_caller]
        fn bf(line: &[u8]) {
            assert_eq!(TryInto::<Reply>::try_into(line), Err(BadFormat));
        }

        // Silly non-replies.
        bf(b"");
        bf(b" ");
        bf(b" INSERTED 1");

        ok(b"INSERTED 42", Inserted { id: 42 });
        bf(b"INSERTED");
        bf(b"INSERTED x");
        bf(b"INSERTED 1 2");
        bf(format!("INSERTED {U64_MAX_PLUS_1}").as_bytes());

        ok(b"BURIED", Buried { id: None });
        ok(b"BURIED 17", Buried { id: Some(17) });

        ok(b"RESERVED 9 120", Reserved { id: 9, n_bytes: 120 });
        bf(b"RESERVED 9");
        ok(b"FOUND 3 5", Found { id: 3, n_bytes: 5 });

        ok(b"OK 137", OkData { n_bytes: 137 });
        bf(b"OK");

        ok(
            b"USING tube_name_here-098+/;.()-",
            Using {
                tube: "tube_name_here-098+/;.()-".into(),
            },
        );
        bf(b"USING -foo");
        bf(b"USING foo bar");
        bf(b"USING");

        ok(b"WATCHING 2", Watching { count: 2 });
        bf(format!("WATCHING {U32_MAX_PLUS_1}").as_bytes());

        ok(b"DELETED", Deleted);
        bf(b"DELETED 1");
        ok(b"RELEASED", Released);
        ok(b"NOT_FOUND", NotFound);
        ok(b"DRAINING", Draining);

        // Unrecognised words pass through whole for classification.
        ok(
            b"TIMED_OUT",
            Other {
                word: "TIMED_OUT".into(),
                line: "TIMED_OUT".into(),
            },
        );
        ok(
            b"KICKED 4",
            Other {
                word: "KICKED".into(),
                line: "KICKED 4".into(),
            },
        );
        ok(
            b"EXPECTED_CRLF",
            Other {
                word: "EXPECTED_CRLF".into(),
                line: "EXPECTED_CRLF".into(),
            },
        );
    }

    #[test]
    fn test_tube_name_rules() {
        assert!(is_valid_tube_name("default"));
        assert!(is_valid_tube_name("a-b.c$d(e)f"));
        assert!(!is_valid_tube_name(""));
        assert!(!is_valid_tube_name("-leading"));
        assert!(!is_valid_tube_name("has space"));
        assert!(!is_valid_tube_name("has#hash"));

        let name_200: String = (0..200).map(|_| 'a').collect();
        let name_201: String = (0..201).map(|_| 'a').collect();
        assert!(is_valid_tube_name(&name_200));
        assert!(!is_valid_tube_name(&name_201));
    }
}
