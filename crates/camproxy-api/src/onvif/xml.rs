//! Namespace-agnostic XML extraction.
//!
//! ONVIF devices disagree wildly on namespace prefixes, so elements are
//! matched on their local name only (`tt:XAddr`, `XAddr` and `ns3:XAddr`
//! all match `"XAddr"`). This is a scanner over the raw text, not a parser:
//! good enough for the handful of SOAP responses the adapter reads.

use std::borrow::Cow;

/// An element located in a document.
#[derive(Debug, Clone, Copy)]
pub struct Element<'a> {
    /// Start tag text between `<` and `>`, name and attributes included.
    start_tag: &'a str,
    /// Raw inner content. Empty for self-closing elements.
    pub content: &'a str,
}

impl Element<'_> {
    /// Attribute value by local name, unescaped.
    pub fn attr(&self, name: &str) -> Option<String> {
        let mut rest = self.start_tag[tag_name(self.start_tag).len()..].trim_start();
        loop {
            let eq = rest.find('=')?;
            let key = rest[..eq].trim();
            let after = rest[eq + 1..].trim_start();
            let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let close = after[1..].find(quote)?;
            let value = &after[1..=close];
            if local_name(key) == name {
                return Some(unescape(value).into_owned());
            }
            rest = after[close + 2..].trim_start();
        }
    }

    /// Trimmed, unescaped text content.
    pub fn text(&self) -> String {
        unescape(self.content.trim()).into_owned()
    }
}

/// First element with local name `local`.
pub fn element<'a>(xml: &'a str, local: &str) -> Option<Element<'a>> {
    next_element(xml, 0, local).map(|(el, _)| el)
}

/// Every top-level occurrence of `local`, in document order.
///
/// Occurrences nested inside an earlier match are not returned separately.
pub fn elements<'a>(xml: &'a str, local: &str) -> Vec<Element<'a>> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some((el, end)) = next_element(xml, cursor, local) {
        out.push(el);
        cursor = end;
    }
    out
}

/// Non-empty text of the first `local` element.
pub fn text(xml: &str, local: &str) -> Option<String> {
    let value = element(xml, local)?.text();
    (!value.is_empty()).then_some(value)
}

/// Text of `leaf` inside the first `parent` element.
pub fn nested_text(xml: &str, parent: &str, leaf: &str) -> Option<String> {
    text(element(xml, parent)?.content, leaf)
}

/// Escape text for inclusion in an XML document.
pub fn escape(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

fn unescape(raw: &str) -> Cow<'_, str> {
    if !raw.contains('&') {
        return Cow::Borrowed(raw);
    }
    Cow::Owned(
        raw.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&"),
    )
}

fn local_name(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

fn tag_name(s: &str) -> &str {
    let end = s
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(s.len());
    &s[..end]
}

/// Locate the next `local` element at or after byte `from`. Returns the
/// element and the byte offset just past it.
fn next_element<'a>(xml: &'a str, from: usize, local: &str) -> Option<(Element<'a>, usize)> {
    let mut pos = from;
    loop {
        let lt = pos + xml.get(pos..)?.find('<')?;
        pos = lt + 1;
        let qname = tag_name(&xml[lt + 1..]);
        if qname.is_empty() || qname.starts_with(['?', '!']) || local_name(qname) != local {
            continue;
        }

        let gt = lt + 1 + xml[lt + 1..].find('>')?;
        let start_tag = &xml[lt + 1..gt];
        if start_tag.ends_with('/') {
            return Some((
                Element {
                    start_tag,
                    content: "",
                },
                gt + 1,
            ));
        }

        let (content_end, after) = find_close(xml, gt + 1, qname)?;
        return Some((
            Element {
                start_tag,
                content: &xml[gt + 1..content_end],
            },
            after,
        ));
    }
}

/// Find the `</qname>` matching an open tag, skipping nested elements of the
/// same qualified name. Returns the offset of the close tag and the offset
/// just past it.
fn find_close(xml: &str, from: usize, qname: &str) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    let mut pos = from;
    loop {
        let lt = pos + xml.get(pos..)?.find('<')?;
        let rest = &xml[lt + 1..];
        let gt = lt + 1 + rest.find('>')?;

        if let Some(closing) = rest.strip_prefix('/') {
            if tag_name(closing) == qname {
                if depth == 0 {
                    return Some((lt, gt + 1));
                }
                depth -= 1;
            }
        } else if tag_name(rest) == qname && !xml[lt + 1..gt].ends_with('/') {
            depth += 1;
        }
        pos = gt + 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CAPS: &str = r#"<?xml version="1.0"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body>
    <tds:GetCapabilitiesResponse>
      <tds:Capabilities>
        <tt:Events><tt:XAddr>http://10.0.0.5:2020/onvif/event_service</tt:XAddr></tt:Events>
        <tt:Media><tt:XAddr>http://10.0.0.5:2020/onvif/service?a=1&amp;b=2</tt:XAddr></tt:Media>
      </tds:Capabilities>
    </tds:GetCapabilitiesResponse>
  </env:Body>
</env:Envelope>"#;

    #[test]
    fn matches_on_local_name_regardless_of_prefix() {
        assert_eq!(
            nested_text(CAPS, "Events", "XAddr").as_deref(),
            Some("http://10.0.0.5:2020/onvif/event_service")
        );
    }

    #[test]
    fn unescapes_entities() {
        assert_eq!(
            nested_text(CAPS, "Media", "XAddr").as_deref(),
            Some("http://10.0.0.5:2020/onvif/service?a=1&b=2")
        );
    }

    #[test]
    fn handles_nested_same_local_name() {
        let xml = r#"<wsnt:Message><tt:Message UtcTime="2024-05-01T10:00:00Z"><tt:Data/></tt:Message></wsnt:Message><wsnt:Message>second</wsnt:Message>"#;
        let outer = elements(xml, "Message");
        assert_eq!(outer.len(), 2);
        let inner = element(outer[0].content, "Message").unwrap();
        assert_eq!(inner.attr("UtcTime").as_deref(), Some("2024-05-01T10:00:00Z"));
        assert_eq!(outer[1].text(), "second");
    }

    #[test]
    fn self_closing_attributes() {
        let xml = r#"<tt:SimpleItem Name="IsMotion" Value='true'/>"#;
        let item = element(xml, "SimpleItem").unwrap();
        assert_eq!(item.attr("Name").as_deref(), Some("IsMotion"));
        assert_eq!(item.attr("Value").as_deref(), Some("true"));
        assert!(item.attr("Missing").is_none());
        assert!(item.content.is_empty());
    }

    #[test]
    fn missing_or_empty_elements_yield_none() {
        assert!(text(CAPS, "Analytics").is_none());
        assert!(text("<a:Uri>  </a:Uri>", "Uri").is_none());
    }

    #[test]
    fn escape_round_trips_specials() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a<b&\"c\""), "a&lt;b&amp;&quot;c&quot;");
    }
}
