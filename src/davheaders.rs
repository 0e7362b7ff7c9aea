use std::fmt;
use std::time::Duration;

use headers::Header;
use http::header::{HeaderName, HeaderValue};

lazy_static! {
    static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    static ref DESTINATION: HeaderName = HeaderName::from_static("destination");
    static ref OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
    static ref TIMEOUT: HeaderName = HeaderName::from_static("timeout");
    static ref LOCK_TOKEN: HeaderName = HeaderName::from_static("lock-token");
    static ref IF: HeaderName = HeaderName::from_static("if");
    static ref IF_MATCH: HeaderName = HeaderName::from_static("if-match");
    static ref IF_NONE_MATCH: HeaderName = HeaderName::from_static("if-none-match");
}

// helper.
fn one<'i, I>(values: &mut I) -> Result<&'i HeaderValue, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let v = values.next().ok_or_else(headers::Error::invalid)?;
    if values.next().is_some() {
        return Err(headers::Error::invalid());
    }
    Ok(v)
}

// helper
fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

macro_rules! header {
    ($tname:ident, $hname:ident, $sname:expr) => {
        lazy_static! {
            static ref $hname: HeaderName = HeaderName::from_static($sname);
        }

        #[derive(Debug, Clone, PartialEq)]
        pub struct $tname(pub String);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                &$hname
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                one(values)?
                    .to_str()
                    .map(|x| $tname(x.to_owned()))
                    .map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where
                E: Extend<HeaderValue>,
            {
                if let Ok(value) = HeaderValue::from_str(&self.0) {
                    values.extend(std::iter::once(value))
                }
            }
        }
    };
}

header!(XSendfile, X_SENDFILE, "x-sendfile");
header!(XAccelRedirect, X_ACCEL_REDIRECT, "x-accel-redirect");

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?;
        match value.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            v if v.eq_ignore_ascii_case(b"infinity") => Ok(Depth::Infinity),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// Destination: header. Either an absolute URL or an absolute path.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        if s.starts_with('/') {
            return Ok(Destination(s.to_string()));
        }
        if let Some(idx) = s.find("://") {
            let url = &s[idx + 3..];
            if url.contains('/') {
                return Ok(Destination(s.to_string()));
            }
        }
        Err(headers::Error::invalid())
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Overwrite: header. Only `T` and `F` are valid.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        match one(values)?.as_bytes() {
            b"F" => Ok(Overwrite(false)),
            b"T" => Ok(Overwrite(true)),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// One entry of the Timeout: header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavTimeout {
    Seconds(u32),
    Infinite,
}

/// Timeout: header, in order of preference of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeout(pub Vec<DavTimeout>);

impl Timeout {
    /// The first timeout the client asked for, capped at `max`.
    pub fn duration(&self, max: Duration) -> Duration {
        match self.0.first() {
            Some(DavTimeout::Seconds(n)) => Duration::from_secs(*n as u64).min(max),
            Some(DavTimeout::Infinite) | None => max,
        }
    }
}

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?.to_str().map_err(map_invalid)?;
        let mut v = Vec::new();
        for word in value.split(',').map(|w| w.trim()) {
            let tm = if word.eq_ignore_ascii_case("infinite") {
                DavTimeout::Infinite
            } else if word.len() > 7
                && word.get(..7).map_or(false, |w| w.eq_ignore_ascii_case("second-"))
            {
                match word[7..].parse::<u32>() {
                    Ok(n) => DavTimeout::Seconds(n),
                    // a number bigger than u32::MAX is as good as infinite.
                    Err(_) if word[7..].bytes().all(|b| b.is_ascii_digit()) => {
                        DavTimeout::Infinite
                    }
                    Err(_) => return Err(headers::Error::invalid()),
                }
            } else {
                return Err(headers::Error::invalid());
            };
            v.push(tm);
        }
        Ok(Timeout(v))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = self
            .0
            .iter()
            .map(|t| match t {
                DavTimeout::Seconds(n) => format!("Second-{n}"),
                DavTimeout::Infinite => "Infinite".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Lock-Token: header. Stored without the angle brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl Header for LockToken {
    fn name() -> &'static HeaderName {
        &LOCK_TOKEN
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?.trim();
        match s.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            Some(token) if !token.is_empty() => Ok(LockToken(token.to_string())),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&format!("<{}>", self.0)) {
            values.extend(std::iter::once(value));
        }
    }
}

/// A list of entity tags, as used by If-Match and If-None-Match.
///
/// Tags are kept without quotes and without the weak `W/` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ETagList {
    Star,
    Tags(Vec<String>),
}

impl ETagList {
    /// Does `etag` (unquoted) match this list?
    pub fn matches(&self, etag: &str) -> bool {
        match self {
            ETagList::Star => true,
            ETagList::Tags(tags) => tags.iter().any(|t| t == etag),
        }
    }
}

fn unquote_etag(s: &str) -> Option<String> {
    let s = s.trim();
    let s = s.strip_prefix("W/").unwrap_or(s);
    let s = s.strip_prefix('"')?.strip_suffix('"')?;
    if s.contains('"') {
        return None;
    }
    Some(s.to_string())
}

fn decode_etaglist<'i, I>(values: &mut I) -> Result<ETagList, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let mut tags = Vec::new();
    let mut count = 0;
    for value in values {
        let s = value.to_str().map_err(map_invalid)?;
        if s.trim() == "*" {
            return Ok(ETagList::Star);
        }
        for t in s.split(',').filter(|t| !t.trim().is_empty()) {
            tags.push(unquote_etag(t).ok_or_else(headers::Error::invalid)?);
        }
        count += 1;
    }
    if count == 0 {
        return Err(headers::Error::invalid());
    }
    Ok(ETagList::Tags(tags))
}

fn encode_etaglist<E>(list: &ETagList, values: &mut E)
where
    E: Extend<HeaderValue>,
{
    let value = match list {
        ETagList::Star => "*".to_string(),
        ETagList::Tags(t) => t
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(", "),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        values.extend(std::iter::once(value));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfMatch(pub ETagList);

impl Header for IfMatch {
    fn name() -> &'static HeaderName {
        &IF_MATCH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        Ok(IfMatch(decode_etaglist(values)?))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        encode_etaglist(&self.0, values)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfNoneMatch(pub ETagList);

impl Header for IfNoneMatch {
    fn name() -> &'static HeaderName {
        &IF_NONE_MATCH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        Ok(IfNoneMatch(decode_etaglist(values)?))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        encode_etaglist(&self.0, values)
    }
}

/// One condition inside a parenthesised list of an If: header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfItem {
    StateToken(String),
    ETag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfCondition {
    pub not: bool,
    pub item: IfItem,
}

/// One parenthesised list, optionally tagged with a resource URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfList {
    pub resource_tag: Option<String>,
    pub conditions: Vec<IfCondition>,
}

/// If: header (RFC 4918, section 10.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct If(pub Vec<IfList>);

impl If {
    /// All state tokens that are not negated.
    pub fn state_tokens(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|l| l.conditions.iter())
            .filter(|c| !c.not)
            .filter_map(|c| match &c.item {
                IfItem::StateToken(t) => Some(t.clone()),
                IfItem::ETag(_) => None,
            })
            .collect()
    }
}

// Read up to the closing delimiter, return the text in between.
fn take_until<'a>(s: &mut &'a str, close: char) -> Option<&'a str> {
    let idx = s.find(close)?;
    let inner = &s[..idx];
    *s = &s[idx + 1..];
    Some(inner)
}

fn parse_if(value: &str) -> Option<If> {
    let mut lists = Vec::new();
    let mut rest = value.trim_start();
    let mut tag: Option<String> = None;
    let mut tagged = None;

    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix('<') {
            // resource tag. Either all lists are tagged, or none.
            if tagged == Some(false) {
                return None;
            }
            tagged = Some(true);
            rest = r;
            tag = Some(take_until(&mut rest, '>')?.to_string());
        } else if let Some(r) = rest.strip_prefix('(') {
            if tagged.is_none() {
                tagged = Some(false);
            }
            if tagged == Some(true) && tag.is_none() {
                return None;
            }
            rest = r;
            let mut conditions = Vec::new();
            loop {
                rest = rest.trim_start();
                if let Some(r) = rest.strip_prefix(')') {
                    rest = r;
                    break;
                }
                let mut not = false;
                if rest.get(..3).map_or(false, |w| w.eq_ignore_ascii_case("not")) {
                    not = true;
                    rest = rest[3..].trim_start();
                }
                let item = if let Some(r) = rest.strip_prefix('<') {
                    rest = r;
                    IfItem::StateToken(take_until(&mut rest, '>')?.to_string())
                } else if let Some(r) = rest.strip_prefix('[') {
                    rest = r;
                    IfItem::ETag(unquote_etag(take_until(&mut rest, ']')?)?)
                } else {
                    return None;
                };
                conditions.push(IfCondition { not, item });
            }
            if conditions.is_empty() {
                return None;
            }
            lists.push(IfList {
                resource_tag: tag.clone(),
                conditions,
            });
        } else {
            return None;
        }
        rest = rest.trim_start();
    }
    if lists.is_empty() {
        return None;
    }
    Some(If(lists))
}

impl Header for If {
    fn name() -> &'static HeaderName {
        &IF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?.to_str().map_err(map_invalid)?;
        parse_if(value).ok_or_else(headers::Error::invalid)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = self.to_string();
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

impl fmt::Display for If {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for list in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if let Some(tag) = &list.resource_tag {
                write!(f, "<{tag}> ")?;
            }
            write!(f, "(")?;
            for (i, c) in list.conditions.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                if c.not {
                    write!(f, "Not ")?;
                }
                match &c.item {
                    IfItem::StateToken(t) => write!(f, "<{t}>")?,
                    IfItem::ETag(e) => write!(f, "[\"{e}\"]")?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headers::HeaderMapExt;
    use http::HeaderMap;

    fn map(name: &'static str, value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn depth_and_overwrite() {
        assert_eq!(map("depth", "infinity").typed_get::<Depth>(), Some(Depth::Infinity));
        assert_eq!(map("depth", "1").typed_get::<Depth>(), Some(Depth::One));
        assert!(map("depth", "2").typed_try_get::<Depth>().is_err());
        assert_eq!(map("overwrite", "F").typed_get::<Overwrite>(), Some(Overwrite(false)));
        assert!(map("overwrite", "yes").typed_try_get::<Overwrite>().is_err());
    }

    #[test]
    fn timeout() {
        let t = map("timeout", "Second-60, Infinite").typed_get::<Timeout>().unwrap();
        assert_eq!(t.0, vec![DavTimeout::Seconds(60), DavTimeout::Infinite]);
        assert_eq!(t.duration(Duration::from_secs(30)), Duration::from_secs(30));
        let t = map("timeout", "Infinite").typed_get::<Timeout>().unwrap();
        assert_eq!(t.duration(Duration::from_secs(600)), Duration::from_secs(600));
        assert!(map("timeout", "Minute-3").typed_try_get::<Timeout>().is_err());
    }

    #[test]
    fn etag_lists() {
        let l = map("if-match", "\"abc\", W/\"def\"").typed_get::<IfMatch>().unwrap();
        assert!(l.0.matches("abc"));
        assert!(l.0.matches("def"));
        assert!(!l.0.matches("xyz"));
        let l = map("if-none-match", "*").typed_get::<IfNoneMatch>().unwrap();
        assert_eq!(l.0, ETagList::Star);
        assert!(map("if-match", "abc").typed_try_get::<IfMatch>().is_err());
    }

    #[test]
    fn if_header() {
        let h = map(
            "if",
            "<http://h/b/x> (<urn:uuid:1234> [\"e1\"]) (Not <urn:uuid:5678>)",
        );
        let i = h.typed_get::<If>().unwrap();
        assert_eq!(i.0.len(), 2);
        assert_eq!(i.0[0].resource_tag.as_deref(), Some("http://h/b/x"));
        assert_eq!(i.0[1].resource_tag.as_deref(), Some("http://h/b/x"));
        assert_eq!(i.state_tokens(), vec!["urn:uuid:1234".to_string()]);

        let i = map("if", "(<urn:uuid:a>)").typed_get::<If>().unwrap();
        assert_eq!(i.to_string(), "(<urn:uuid:a>)");

        assert!(map("if", "(<urn:uuid:a>").typed_try_get::<If>().is_err());
        assert!(map("if", "garbage").typed_try_get::<If>().is_err());
        assert!(map("if", "()").typed_try_get::<If>().is_err());
    }

    #[test]
    fn lock_token() {
        let t = map("lock-token", "<urn:uuid:42>").typed_get::<LockToken>().unwrap();
        assert_eq!(t.0, "urn:uuid:42");
        assert!(map("lock-token", "urn:uuid:42").typed_try_get::<LockToken>().is_err());
    }
}
