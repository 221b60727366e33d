//! Tolerant markup parsing for feed snapshots.
//!
//! This is not a conforming HTML5 parser. It builds just enough of a tree to
//! answer "which article holds this link" style questions about a page
//! snapshot, and it never fails: anything it does not recognise as a tag is
//! kept as text. Tag and attribute names are matched case-insensitively by
//! lowercasing them at parse time.

pub type NodeId = usize;

const ROOT: NodeId = 0;

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_TAGS: &[&str] = &["script", "style"];

#[derive(Debug, Clone)]
enum Node {
    Element(NodeId),
    Text(String),
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    parent: Option<NodeId>,
    children: Vec<Node>,
}

impl Element {
    fn new(name: String, attrs: Vec<(String, String)>, parent: Option<NodeId>) -> Self {
        Self { name, attrs, parent, children: Vec::new() }
    }
}

/// Parsed snapshot. Element ids follow document order.
#[derive(Debug, Clone)]
pub struct Document {
    elements: Vec<Element>,
}

impl Document {
    pub fn parse(html: &str) -> Self {
        Parser::new(html).run()
    }

    /// All elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = NodeId> + '_ {
        1..self.elements.len()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.elements[id].name
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.elements[id]
            .attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.elements[id].parent.filter(|&p| p != ROOT)
    }

    /// Nearest element named `tag`, starting with `id` itself.
    pub fn closest(&self, id: NodeId, tag: &str) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            if self.elements[node].name.eq_ignore_ascii_case(tag) {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    /// Descendants of `id` (not `id` itself) in document order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        // Explicit stack: nesting depth is controlled by the page.
        let mut stack = self.child_elements_reversed(id);
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.child_elements_reversed(node));
        }
        out
    }

    fn child_elements_reversed(&self, id: NodeId) -> Vec<NodeId> {
        self.elements[id]
            .children
            .iter()
            .rev()
            .filter_map(|child| match child {
                Node::Element(e) => Some(*e),
                Node::Text(_) => None,
            })
            .collect()
    }

    pub fn find_descendant<F>(&self, id: NodeId, pred: F) -> Option<NodeId>
    where
        F: Fn(NodeId) -> bool,
    {
        self.descendants(id).into_iter().find(|&d| pred(d))
    }

    /// Concatenated text of every text node under `id`.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        let mut stack: Vec<&Node> = self.elements[id].children.iter().rev().collect();
        while let Some(node) = stack.pop() {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => stack.extend(self.elements[*e].children.iter().rev()),
            }
        }
        out
    }
}

struct OpenTag {
    name: String,
    attrs: Vec<(String, String)>,
    self_closing: bool,
    end: usize,
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    text_start: usize,
    doc: Document,
    stack: Vec<NodeId>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        let root = Element::new("#root".to_string(), Vec::new(), None);
        Self { src, pos: 0, text_start: 0, doc: Document { elements: vec![root] }, stack: vec![ROOT] }
    }

    fn run(mut self) -> Document {
        let src = self.src;
        let bytes = src.as_bytes();
        while self.pos < bytes.len() {
            if bytes[self.pos] != b'<' {
                self.pos += 1;
                continue;
            }
            let rest = &src[self.pos..];
            let next = bytes.get(self.pos + 1).copied();

            if rest.starts_with("<!--") {
                let end = rest.find("-->").map(|i| self.pos + i + 3).unwrap_or(bytes.len());
                self.skip_to(end);
            } else if matches!(next, Some(b'!') | Some(b'?')) {
                let end = rest.find('>').map(|i| self.pos + i + 1).unwrap_or(bytes.len());
                self.skip_to(end);
            } else if next == Some(b'/')
                && bytes.get(self.pos + 2).is_some_and(|b| b.is_ascii_alphabetic())
            {
                let name_start = self.pos + 2;
                let mut i = name_start;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' && bytes[i] != b'/' {
                    i += 1;
                }
                let name = src[name_start..i].to_ascii_lowercase();
                let end = src[i..].find('>').map(|j| i + j + 1).unwrap_or(bytes.len());
                self.skip_to(end);
                self.close(&name);
            } else if next.is_some_and(|b| b.is_ascii_alphabetic()) {
                match parse_open_tag(src, self.pos) {
                    Some(tag) => self.open(tag),
                    // Unterminated tag: keep the rest as text.
                    None => self.pos = bytes.len(),
                }
            } else {
                self.pos += 1;
            }
        }
        self.flush_text(bytes.len());
        self.doc
    }

    fn current(&self) -> NodeId {
        *self.stack.last().unwrap_or(&ROOT)
    }

    fn flush_text(&mut self, until: usize) {
        if until > self.text_start {
            let text = decode_entities(&self.src[self.text_start..until]);
            let parent = self.current();
            self.doc.elements[parent].children.push(Node::Text(text));
        }
    }

    fn skip_to(&mut self, end: usize) {
        self.flush_text(self.pos);
        self.pos = end;
        self.text_start = end;
    }

    fn open(&mut self, tag: OpenTag) {
        self.flush_text(self.pos);
        let parent = self.current();
        let id = self.doc.elements.len();
        let is_void = VOID_TAGS.contains(&tag.name.as_str());
        let is_raw = RAW_TEXT_TAGS.contains(&tag.name.as_str());
        self.doc.elements.push(Element::new(tag.name.clone(), tag.attrs, Some(parent)));
        self.doc.elements[parent].children.push(Node::Element(id));
        self.pos = tag.end;
        self.text_start = tag.end;

        if tag.self_closing || is_void {
            return;
        }
        if is_raw {
            let lower = self.src[self.pos..].to_ascii_lowercase();
            let close = format!("</{}", tag.name);
            let (body_end, end) = match lower.find(&close) {
                Some(i) => {
                    let after = self.pos + i + close.len();
                    let end = self.src[after..].find('>').map(|j| after + j + 1).unwrap_or(self.src.len());
                    (self.pos + i, end)
                }
                None => (self.src.len(), self.src.len()),
            };
            if body_end > self.pos {
                let body = self.src[self.pos..body_end].to_string();
                self.doc.elements[id].children.push(Node::Text(body));
            }
            self.pos = end;
            self.text_start = end;
            return;
        }
        self.stack.push(id);
    }

    fn close(&mut self, name: &str) {
        // Unmatched closing tags are ignored.
        let Some(depth) = self.stack.iter().rposition(|&id| id != ROOT && self.doc.elements[id].name == name) else {
            return;
        };
        self.stack.truncate(depth);
    }
}

/// Parse `<name attr=value ...>` starting at `start` (which points at `<`).
fn parse_open_tag(src: &str, start: usize) -> Option<OpenTag> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut i = start + 1;
    let name_start = i;
    while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }
    let name = src[name_start..i].to_ascii_lowercase();
    let mut attrs = Vec::new();
    let mut self_closing = false;

    loop {
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            return None;
        }
        match bytes[i] {
            b'>' => return Some(OpenTag { name, attrs, self_closing, end: i + 1 }),
            b'/' => {
                self_closing = true;
                i += 1;
                continue;
            }
            _ => self_closing = false,
        }

        let attr_start = i;
        while i < len && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'>' | b'/') {
            i += 1;
        }
        let attr_name = src[attr_start..i].to_ascii_lowercase();
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = String::new();
        if i < len && bytes[i] == b'=' {
            i += 1;
            while i < len && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < len && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                i += 1;
                let value_start = i;
                while i < len && bytes[i] != quote {
                    i += 1;
                }
                if i >= len {
                    return None;
                }
                value = decode_entities(&src[value_start..i]);
                i += 1;
            } else {
                let value_start = i;
                while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                value = decode_entities(&src[value_start..i]);
            }
        }

        if !attr_name.is_empty() {
            attrs.push((attr_name, value));
        }
    }
}

/// Minimal entity decoding for the handful of entities feed markup uses.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(doc: &Document, tag: &str) -> NodeId {
        doc.elements().find(|&id| doc.name(id) == tag).unwrap()
    }

    #[test]
    fn builds_nested_tree() {
        let doc = Document::parse("<div><article><p>Hi <b>there</b></p></article></div>");
        let b = first(&doc, "b");
        let article = doc.closest(b, "article").unwrap();
        assert_eq!(doc.name(article), "article");
        assert_eq!(doc.text_content(article), "Hi there");
        assert_eq!(doc.closest(b, "section"), None);
    }

    #[test]
    fn closest_includes_self() {
        let doc = Document::parse("<article id=a></article>");
        let a = first(&doc, "article");
        assert_eq!(doc.closest(a, "ARTICLE"), Some(a));
    }

    #[test]
    fn reads_quoted_unquoted_and_bare_attributes() {
        let doc = Document::parse(r#"<A HREF="/x?q=%24ABC&amp;src=y" data-testid='socialContext' hidden rel=nofollow>t</A>"#);
        let a = first(&doc, "a");
        assert_eq!(doc.attr(a, "href"), Some("/x?q=%24ABC&src=y"));
        assert_eq!(doc.attr(a, "data-testid"), Some("socialContext"));
        assert_eq!(doc.attr(a, "hidden"), Some(""));
        assert_eq!(doc.attr(a, "rel"), Some("nofollow"));
    }

    #[test]
    fn void_and_self_closing_elements_take_no_children() {
        let doc = Document::parse("<div><img src=a.png><br/><span>x</span></div>");
        let img = first(&doc, "img");
        let span = first(&doc, "span");
        assert_eq!(doc.parent(span), Some(first(&doc, "div")));
        assert!(doc.descendants(img).is_empty());
    }

    #[test]
    fn unmatched_close_is_ignored_and_unclosed_closes_at_eof() {
        let doc = Document::parse("<article><p>one</span>two<a href='/u/status/1'>l</a>");
        let a = first(&doc, "a");
        assert!(doc.closest(a, "article").is_some());
        assert_eq!(doc.text_content(first(&doc, "article")), "onetwol");
    }

    #[test]
    fn script_bodies_are_raw_text() {
        let doc = Document::parse("<script>if (a < b) { x = '<article>'; }</script><p>after</p>");
        assert_eq!(doc.elements().filter(|&id| doc.name(id) == "article").count(), 0);
        let p = first(&doc, "p");
        assert_eq!(doc.parent(p), None);
    }

    #[test]
    fn comments_and_doctype_are_skipped() {
        let doc = Document::parse("<!DOCTYPE html><!-- <article> --><p>x</p>");
        assert_eq!(doc.elements().count(), 1);
    }

    #[test]
    fn stray_angle_brackets_stay_text() {
        let doc = Document::parse("<p>1 < 2 and 3 > 2</p>");
        assert_eq!(doc.text_content(first(&doc, "p")), "1 < 2 and 3 > 2");
    }

    #[test]
    fn descendants_follow_document_order() {
        let doc = Document::parse("<div><p><b>1</b><i>2</i></p><span>3</span></div>");
        let names: Vec<&str> = doc.descendants(first(&doc, "div")).into_iter().map(|id| doc.name(id)).collect();
        assert_eq!(names, ["p", "b", "i", "span"]);
    }

    #[test]
    fn deeply_nested_unclosed_tags_are_walkable() {
        let depth = 100_000;
        let html = format!("<article>{}deep", "<div>".repeat(depth));
        let doc = Document::parse(&html);
        let article = first(&doc, "article");
        assert_eq!(doc.descendants(article).len(), depth);
        assert_eq!(doc.text_content(article), "deep");
        let innermost = doc.elements().last().unwrap();
        assert_eq!(doc.closest(innermost, "article"), Some(article));
    }

    #[test]
    fn unterminated_tag_does_not_panic() {
        let doc = Document::parse("<p>ok</p><a href=\"/broken");
        assert_eq!(doc.elements().count(), 1);
    }
}
