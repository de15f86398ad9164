//! Cross-check of the DOM builder against an independent XML parser
//! (roxmltree): structure, resolved element names, text content.

use rngine::dom::{Document, NodeId, NodeKind};
use rngine::safe_parse;

/// Kanonische Ereignisliste. Benachbarte Texte werden zusammengelegt, weil
/// roxmltree CDATA-Abschnitte als eigene Textknoten fuehrt, unser Baum sie
/// aber koalesziert.
#[derive(Debug, PartialEq)]
enum Item {
    Start(String),
    End,
    Text(String),
    Comment(String),
    Pi(String),
}

fn push_text(out: &mut Vec<Item>, s: &str) {
    if s.is_empty() {
        return;
    }
    if let Some(Item::Text(prev)) = out.last_mut() {
        prev.push_str(s);
    } else {
        out.push(Item::Text(s.to_string()));
    }
}

fn canonical_ours(doc: &Document, node: NodeId, out: &mut Vec<Item>) {
    match doc.kind(node) {
        NodeKind::Document => {
            for &child in doc.children(node) {
                canonical_ours(doc, child, out);
            }
        }
        NodeKind::Element => {
            let name = doc.name(node).unwrap();
            out.push(Item::Start(format!("{{{}}}{}", name.uri, name.local_name)));
            for &child in doc.children(node) {
                canonical_ours(doc, child, out);
            }
            out.push(Item::End);
        }
        NodeKind::Text => push_text(out, doc.text(node).unwrap()),
        NodeKind::Comment => out.push(Item::Comment(doc.text(node).unwrap().to_string())),
        NodeKind::ProcessingInstruction => {
            out.push(Item::Pi(doc.name(node).unwrap().local_name.to_string()));
        }
    }
}

fn canonical_roxml(node: roxmltree::Node<'_, '_>, out: &mut Vec<Item>) {
    for child in node.children() {
        if child.is_element() {
            out.push(Item::Start(format!(
                "{{{}}}{}",
                child.tag_name().namespace().unwrap_or(""),
                child.tag_name().name()
            )));
            canonical_roxml(child, out);
            out.push(Item::End);
        } else if child.is_text() {
            push_text(out, child.text().unwrap_or(""));
        } else if child.is_comment() {
            out.push(Item::Comment(child.text().unwrap_or("").to_string()));
        } else if child.is_pi() {
            out.push(Item::Pi(child.pi().unwrap().target.to_string()));
        }
    }
}

fn cross_check(xml: &str) {
    let ours = safe_parse(xml).expect("safe_parse");
    let theirs = roxmltree::Document::parse(xml).expect("roxmltree");

    let mut a = Vec::new();
    canonical_ours(&ours, ours.root(), &mut a);
    let mut b = Vec::new();
    canonical_roxml(theirs.root(), &mut b);
    assert_eq!(a, b, "canonical event mismatch for {xml:?}");
}

#[test]
fn einfache_struktur() {
    cross_check("<a><b/><c>text</c></a>");
}

#[test]
fn namespaces() {
    cross_check(r#"<p:a xmlns:p="http://x" xmlns="http://d"><b/><p:c/></p:a>"#);
}

#[test]
fn gemischter_inhalt() {
    cross_check("<a>one<b/>two<!-- note -->three</a>");
}

#[test]
fn cdata_koaleszenz() {
    cross_check("<a>x<![CDATA[<raw>]]>y</a>");
}

#[test]
fn entities() {
    cross_check("<a>&lt;&amp;&gt;</a>");
}

#[test]
fn verschachtelte_namespace_scopes() {
    cross_check(r#"<a xmlns:p="http://one"><p:b><c xmlns:p="http://two"><p:d/></c></p:b></a>"#);
}

#[test]
fn attribute_werte() {
    // Attribute vergleicht dieser Kanon nicht im Detail; geprueft wird,
    // dass beide Parser das Dokument annehmen und die Struktur gleich ist.
    cross_check(r#"<a id="1" p:x="2" xmlns:p="http://x"><b k="&amp;"/></a>"#);
}

#[test]
fn beide_lehnen_kaputtes_xml_ab() {
    for bad in ["<a><b></a>", "<a", "<a/><'", "<p:a/>"] {
        assert!(safe_parse(bad).is_err(), "{bad}");
        assert!(roxmltree::Document::parse(bad).is_err(), "{bad}");
    }
}
