//! Fuzzt den Validator-Kern: beliebige geparste Dokumente gegen eine feste
//! Grammatik laufen lassen. Engine-Fehler und Panics sind Bugs; Findings
//! sind Domaenen-Output und in Ordnung.

#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use libfuzzer_sys::fuzz_target;
use rngine::grammar::GrammarBuilder;
use rngine::{Validator, ValidatorOptions};

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(doc) = rngine::safe_parse(source) else {
        return;
    };

    // element a { (element b { text } | element * { empty })* }
    let b = GrammarBuilder::new();
    let known = b.element(b.name("", "b"), b.text());
    let wild = b.element(b.any_name(), b.empty());
    let start = b.element(b.name("", "a"), b.zero_or_more(b.choice(known, wild)));
    let grammar = b.finish(start);

    let doc = Rc::new(RefCell::new(doc));
    let mut validator = Validator::new(
        grammar,
        Rc::clone(&doc),
        ValidatorOptions::default().with_walker_cache_gap(2),
    );
    validator.run_to_completion().expect("engine fault");
});
