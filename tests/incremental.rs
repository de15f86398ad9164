//! End-to-end scenarios for the incremental validation engine: complete
//! runs, edits with reset, query layer, and the equivalence invariants
//! between full and resumed validation.

use std::cell::RefCell;
use std::rc::Rc;

use rngine::grammar::GrammarBuilder;
use rngine::{
    Dispatch, Document, EventName, Grammar, NodeId, PropertyValue, ValidationEvent, Validator,
    ValidatorEvent, ValidatorOptions, WorkingState, safe_parse,
};

/// Grammar: element a { element b { empty } }
fn ab_grammar() -> Grammar {
    let b = GrammarBuilder::new();
    let inner = b.element(b.name("", "b"), b.empty());
    let start = b.element(b.name("", "a"), inner);
    b.finish(start)
}

/// Grammar: element a { element b { empty }* }
fn ab_star_grammar() -> Grammar {
    let b = GrammarBuilder::new();
    let inner = b.element(b.name("", "b"), b.empty());
    let start = b.element(b.name("", "a"), b.zero_or_more(inner));
    b.finish(start)
}

fn load(xml: &str) -> Rc<RefCell<Document>> {
    Rc::new(RefCell::new(safe_parse(xml).expect("test document parses")))
}

fn new_validator(grammar: Grammar, doc: &Rc<RefCell<Document>>) -> Validator {
    // Kleiner Cache-Gap, damit auch Mini-Dokumente den Cache ausueben.
    Validator::new(
        grammar,
        Rc::clone(doc),
        ValidatorOptions::default().with_walker_cache_gap(1),
    )
}

fn document_element(doc: &Rc<RefCell<Document>>) -> NodeId {
    doc.borrow().document_element().expect("document element")
}

#[test]
fn vollstaendiger_lauf_wird_valid() {
    let doc = load("<a><b/></a>");
    let mut v = new_validator(ab_grammar(), &doc);
    let snapshot = v.run_to_completion().unwrap();
    assert_eq!(snapshot.state, WorkingState::Valid);
    assert_eq!(snapshot.state.code(), 4);
    assert!(v.errors().is_empty());
    assert_eq!(snapshot.part_done, 1.0);
}

#[test]
fn nicht_erlaubtes_kind_mit_besitzer_und_index() {
    let doc = load("<a><c/></a>");
    let a = document_element(&doc);
    let mut v = new_validator(ab_grammar(), &doc);
    let snapshot = v.run_to_completion().unwrap();
    assert_eq!(snapshot.state, WorkingState::Invalid);
    assert_eq!(snapshot.state.code(), 3);
    let errors = v.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node, Some(a));
    assert_eq!(errors[0].index, Some(0));
}

#[test]
fn fehlendes_pflichtkind_wird_invalid() {
    let doc = load("<a></a>");
    let a = document_element(&doc);
    let mut v = new_validator(ab_grammar(), &doc);
    let snapshot = v.run_to_completion().unwrap();
    assert_eq!(snapshot.state, WorkingState::Invalid);
    let errors = v.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node, Some(a));
}

#[test]
fn anfuegen_reset_und_neuvalidierung() {
    let doc = load("<a><b/></a>");
    let a = document_element(&doc);
    let b = doc.borrow().children(a)[0];
    let mut v = new_validator(ab_grammar(), &doc);
    v.run_to_completion().unwrap();
    assert_eq!(v.working_state().state, WorkingState::Valid);

    // Index, an dem das alte endTag von <a> gestempelt wurde: unmittelbar
    // nach dem EventIndexAfter von <b>.
    let Some(PropertyValue::Index(b_after)) = v.node_property(b, "rngineEventIndexAfter") else {
        panic!("b must carry EventIndexAfter");
    };

    let reset_events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reset_events);
    v.events().add(EventName::ResetErrors, move |e| {
        if let ValidatorEvent::ResetErrors { at } = e {
            sink.borrow_mut().push(*at);
        }
        Dispatch::Continue
    });

    let c = {
        let mut d = doc.borrow_mut();
        let c = d.create_element(rngine::QName::new("", "c"));
        d.append_child(a, c);
        c
    };
    v.reset_to(c).unwrap();
    v.start();
    let snapshot = v.run_to_completion().unwrap();

    assert_eq!(snapshot.state, WorkingState::Invalid);
    let errors = v.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node, Some(a));
    assert_eq!(*reset_events.borrow(), vec![b_after]);
}

#[test]
fn possible_where_findet_einfuegeposition() {
    let doc = load("<a><b/></a>");
    let a = document_element(&doc);
    let mut v = new_validator(ab_grammar(), &doc);
    let positions = v
        .possible_where(a, &ValidationEvent::EnterStartTag { ns: "", name: "b" })
        .unwrap();
    assert_eq!(positions, vec![0]);
}

#[test]
fn spekulation_ohne_seiteneffekte() {
    let doc = load("<a><b/></a>");
    let a = document_element(&doc);
    let mut v = new_validator(ab_grammar(), &doc);

    let observed = Rc::new(std::cell::Cell::new(0u32));
    let o = Rc::clone(&observed);
    v.events().add_any(move |_| {
        o.set(o.get() + 1);
        Dispatch::Continue
    });

    assert!(v.speculatively_validate_fragment(a, 0, "<b/>").unwrap().is_none());
    let findings = v.speculatively_validate_fragment(a, 0, "<c/>").unwrap().unwrap();
    assert_eq!(findings.len(), 1);

    assert!(v.errors().is_empty(), "speculation must not leak findings");
    assert_eq!(observed.get(), 0, "speculation must not notify observers");
}

#[test]
fn vollvalidierung_gleich_reset_und_resume() {
    // Ein groesseres Dokument mit einem eingestreuten Fehler.
    let xml = "<a><b/><b/><oops/><b/><b/></a>";

    let doc = load(xml);
    let mut reference = new_validator(ab_star_grammar(), &doc);
    reference.run_to_completion().unwrap();
    let expected_state = reference.working_state().state;
    let expected_errors = reference.errors();
    assert_eq!(expected_state, WorkingState::Invalid);

    // reset_to(root) und erneuter Lauf aendern nichts.
    let root = doc.borrow().root();
    reference.restart_at(root).unwrap();
    reference.run_to_completion().unwrap();
    assert_eq!(reference.working_state().state, expected_state);
    assert_eq!(reference.errors(), expected_errors);

    // Frischer Validator: voll laufen lassen, dann an jedem Kind resetten
    // und zu Ende laufen lassen. Endzustand und Fehlermenge muessen gleich
    // bleiben.
    let children: Vec<NodeId> = {
        let d = doc.borrow();
        let a = d.document_element().unwrap();
        d.children(a).to_vec()
    };
    for &child in &children {
        let mut v = new_validator(ab_star_grammar(), &doc);
        v.run_to_completion().unwrap();
        v.restart_at(child).unwrap();
        v.run_to_completion().unwrap();
        assert_eq!(v.working_state().state, expected_state, "reset at {child:?}");
        assert_eq!(v.errors(), expected_errors, "reset at {child:?}");
    }
}

#[test]
fn cache_und_replay_liefern_gleiche_walker() {
    let xml = "<a><b/><b/><b/><b/></a>";
    let doc = load(xml);
    let a = document_element(&doc);
    let len = doc.borrow().children(a).len();

    // Dicht gecacht vs. gar nicht gecacht (Replay von der Wurzel).
    let mut cached = Validator::new(
        ab_star_grammar(),
        Rc::clone(&doc),
        ValidatorOptions::default().with_walker_cache_gap(1),
    );
    let mut uncached = Validator::new(
        ab_star_grammar(),
        Rc::clone(&doc),
        ValidatorOptions::default().with_walker_cache_gap(100_000),
    );
    cached.run_to_completion().unwrap();
    uncached.run_to_completion().unwrap();

    for index in 0..=len {
        let via_cache = cached.walker_at(a, index, false).unwrap().possible();
        let via_replay = uncached.walker_at(a, index, false).unwrap().possible();
        let enter_b = ValidationEvent::EnterStartTag { ns: "", name: "b" };
        assert_eq!(via_cache.allows(&enter_b), via_replay.allows(&enter_b), "index {index}");
        assert_eq!(via_cache.end_tag, via_replay.end_tag, "index {index}");
        assert_eq!(via_cache.text, via_replay.text, "index {index}");
    }
}

#[test]
fn possible_at_ist_obermenge_der_spekulativ_akzeptierten() {
    let doc = load("<a><b/><b/></a>");
    let a = document_element(&doc);
    let mut v = new_validator(ab_star_grammar(), &doc);
    let len = doc.borrow().children(a).len();

    for index in 0..=len {
        for candidate in ["<b/>", "<c/>"] {
            let accepted = v
                .speculatively_validate_fragment(a, index, candidate)
                .unwrap()
                .is_none();
            if accepted {
                let possible = v.possible_at(a, index, false).unwrap();
                let name = if candidate == "<b/>" { "b" } else { "c" };
                assert!(
                    possible.allows(&ValidationEvent::EnterStartTag { ns: "", name }),
                    "possible_at must admit empirically accepted {candidate} at {index}"
                );
            }
        }
    }
}

#[test]
fn namespaces_szenario() {
    let grammar = {
        let b = GrammarBuilder::new();
        let inner = b.element(b.name("http://x", "b"), b.empty());
        let start = b.element(b.name("http://x", "a"), inner);
        b.finish(start)
    };
    let doc = load(r#"<p:a xmlns:p="http://x"><p:b/></p:a>"#);
    let mut v = new_validator(grammar, &doc);
    let snapshot = v.run_to_completion().unwrap();
    assert_eq!(snapshot.state, WorkingState::Valid);

    let mut schema_ns = v.schema_namespaces();
    schema_ns.sort();
    assert_eq!(schema_ns, vec!["http://x".to_string()]);

    let doc_ns = v.document_namespaces();
    assert_eq!(doc_ns.get("p").unwrap(), &vec!["http://x".to_string()]);
}

#[test]
fn inkrementeller_scheduler_mit_mehreren_pumps() {
    // Budget von 1 ms: je nach Maschine ein oder mehrere Zyklen; die
    // Zusicherungen gelten in beiden Faellen.
    let xml = format!("<a>{}</a>", "<b/>".repeat(200));
    let doc = load(&xml);
    let mut v = Validator::new(
        ab_star_grammar(),
        Rc::clone(&doc),
        ValidatorOptions::default()
            .with_walker_cache_gap(10)
            .with_max_timespan(1),
    );

    let states = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&states);
    v.events().add(EventName::StateUpdate, move |e| {
        if let ValidatorEvent::StateUpdate(s) = e {
            sink.borrow_mut().push((s.state, s.part_done));
        }
        Dispatch::Continue
    });

    v.start();
    assert_eq!(v.working_state().state, WorkingState::Working);
    let mut guard = 0;
    while v.working_state().state == WorkingState::Working {
        v.pump().unwrap();
        guard += 1;
        assert!(guard < 10_000, "validation must terminate");
    }
    assert_eq!(v.working_state().state, WorkingState::Valid);

    let states = states.borrow();
    assert_eq!(states.last().unwrap().0, WorkingState::Valid);
    assert!(states.windows(2).all(|w| w[0].1 <= w[1].1), "part_done monotonic");
}

#[test]
fn entfernen_eines_kindes_macht_wieder_gueltig() {
    let doc = load("<a><b/><oops/></a>");
    let a = document_element(&doc);
    let mut v = new_validator(ab_star_grammar(), &doc);
    v.run_to_completion().unwrap();
    assert_eq!(v.working_state().state, WorkingState::Invalid);
    assert_eq!(v.errors().len(), 1);

    {
        let mut d = doc.borrow_mut();
        let oops = d.children(a)[1];
        d.remove_child(oops);
    }
    // Reset auf das verbliebene erste Kind: alles ab dort wird neu geprueft.
    let b = doc.borrow().children(a)[0];
    v.restart_at(b).unwrap();
    v.run_to_completion().unwrap();
    assert_eq!(v.working_state().state, WorkingState::Valid);
    assert!(v.errors().is_empty());
    assert!(v.errors_for(a).is_empty());
}

#[test]
fn errors_for_nach_mehreren_fehlern() {
    let doc = load("<a><oops/><b/><mehr/></a>");
    let a = document_element(&doc);
    let mut v = new_validator(ab_star_grammar(), &doc);
    v.run_to_completion().unwrap();
    let errors = v.errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(v.errors_for(a).len(), 2);
    assert_eq!(v.errors_for(a)[0].index, Some(0));
    assert_eq!(v.errors_for(a)[1].index, Some(2));
}

#[test]
fn text_inhalt_und_gemischter_inhalt() {
    let grammar = {
        let b = GrammarBuilder::new();
        let start = b.element(b.name("", "a"), b.text());
        b.finish(start)
    };
    let doc = load("<a>hello world</a>");
    let mut v = new_validator(grammar, &doc);
    assert_eq!(v.run_to_completion().unwrap().state, WorkingState::Valid);

    let grammar = {
        let b = GrammarBuilder::new();
        let start = b.element(b.name("", "a"), b.empty());
        b.finish(start)
    };
    let doc = load("<a>stray</a>");
    let a = document_element(&doc);
    let mut v = new_validator(grammar, &doc);
    assert_eq!(v.run_to_completion().unwrap().state, WorkingState::Invalid);
    assert_eq!(v.errors()[0].node, Some(a));
}

#[test]
fn attribut_szenarien() {
    // element a { attribute id { text }, element b { empty } }
    let grammar = {
        let g = GrammarBuilder::new();
        let attr = g.attribute(g.name("", "id"));
        let inner = g.element(g.name("", "b"), g.empty());
        let start = g.element(g.name("", "a"), g.group(attr, inner));
        g.finish(start)
    };

    let doc = load(r#"<a id="1"><b/></a>"#);
    let mut v = new_validator(grammar.clone(), &doc);
    assert_eq!(v.run_to_completion().unwrap().state, WorkingState::Valid);

    let doc = load("<a><b/></a>");
    let a = document_element(&doc);
    let mut v = new_validator(grammar.clone(), &doc);
    assert_eq!(v.run_to_completion().unwrap().state, WorkingState::Invalid);
    assert_eq!(v.errors_for(a).len(), 1);

    let doc = load(r#"<a id="1" bogus="x"><b/></a>"#);
    let a = document_element(&doc);
    let mut v = new_validator(grammar, &doc);
    assert_eq!(v.run_to_completion().unwrap().state, WorkingState::Invalid);
    assert_eq!(v.errors_for(a).len(), 1);
}

#[test]
fn possible_at_fuer_attribute() {
    let grammar = {
        let g = GrammarBuilder::new();
        let attr = g.attribute(g.name("", "id"));
        let start = g.element(g.name("", "a"), attr);
        g.finish(start)
    };
    let doc = load(r#"<a id="1"/>"#);
    let a = document_element(&doc);
    let mut v = new_validator(grammar, &doc);

    // Vor dem ersten Attribut: id ist moeglich.
    let possible = v.possible_at(a, 0, true).unwrap();
    assert!(possible.allows(&ValidationEvent::AttributeName { ns: "", name: "id" }));
    // Nach dem Attribut (Position 1): id ist verbraucht.
    let possible = v.possible_at(a, 1, true).unwrap();
    assert!(!possible.allows(&ValidationEvent::AttributeName { ns: "", name: "id" }));
}
