/// Well-known RTSP field names in their canonical spelling.
///
/// Lookups are case-insensitive (RFC 2326 §4.2), but some camera firmware
/// only accepts the canonical form on the wire, `CSeq` in particular.
const CANONICAL_NAMES: &[&str] = &[
    "Authorization",
    "Content-Base",
    "Content-Length",
    "Content-Type",
    "CSeq",
    "Public",
    "RTP-Info",
    "Session",
    "Transport",
    "WWW-Authenticate",
];

/// Return the canonical spelling of `name` if it is a known field, or `name`
/// unchanged otherwise.
pub fn canonical_name(name: &str) -> &str {
    CANONICAL_NAMES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(name))
        .copied()
        .unwrap_or(name)
}

/// Ordered RTSP header multimap.
///
/// Names are stored as received and compared case-insensitively. Order is
/// preserved so a relayed message keeps the client's header layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a value without touching existing ones.
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Replace every value of `name` with a single `value`.
    ///
    /// The first existing occurrence keeps its position; a new field is
    /// appended at the end.
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(pos) => {
                self.entries[pos].1 = value.to_string();
                let mut idx = 0;
                self.entries.retain(|(key, _)| {
                    let keep = idx <= pos || !key.eq_ignore_ascii_case(name);
                    idx += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    /// Remove every value of `name`. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Extend the value of the most recent field (MIME continuation line).
    pub(crate) fn continue_last(&mut self, more: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, value)) => {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(more);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Append `Name: value\r\n` lines to `out`, canonicalising known names.
    ///
    /// CR and LF inside values are replaced by spaces so a value can never
    /// inject an extra header line.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(canonical_name(name).as_bytes());
            out.extend_from_slice(b": ");
            out.extend(
                value
                    .bytes()
                    .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
            );
            out.extend_from_slice(b"\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_case_insensitive() {
        let mut h = Headers::new();
        h.append("cseq", "42");
        assert_eq!(h.get("CSeq"), Some("42"));
        assert_eq!(h.get("CSEQ"), Some("42"));
        assert!(h.contains("Cseq"));
    }

    #[test]
    fn cseq_written_canonically() {
        let mut h = Headers::new();
        h.append("Cseq", "3");
        h.append("x-custom", "a");
        let mut out = Vec::new();
        h.write_to(&mut out);
        assert_eq!(out, b"CSeq: 3\r\nx-custom: a\r\n");
    }

    #[test]
    fn set_replaces_in_place() {
        let mut h = Headers::new();
        h.append("CSeq", "1");
        h.append("authorization", "Basic old");
        h.append("Accept", "application/sdp");
        h.append("Authorization", "Digest other");
        h.set("Authorization", "Basic new");

        let fields: Vec<_> = h.iter().collect();
        assert_eq!(
            fields,
            vec![
                ("CSeq", "1"),
                ("authorization", "Basic new"),
                ("Accept", "application/sdp"),
            ]
        );
    }

    #[test]
    fn set_appends_when_missing() {
        let mut h = Headers::new();
        h.set("Session", "abc");
        assert_eq!(h.get("session"), Some("abc"));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn multimap_keeps_all_values() {
        let mut h = Headers::new();
        h.append("Via", "a");
        h.append("via", "b");
        assert_eq!(h.get_all("VIA").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(h.remove("Via"), 2);
        assert!(h.is_empty());
    }

    #[test]
    fn values_cannot_inject_lines() {
        let mut h = Headers::new();
        h.append("X", "a\r\nInjected: 1");
        let mut out = Vec::new();
        h.write_to(&mut out);
        assert_eq!(out, b"X: a  Injected: 1\r\n");
    }
}
