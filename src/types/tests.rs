use super::*;

fn span(start_line: usize, end_line: usize) -> Span {
    Span {
        start_line,
        end_line,
        start_byte: 0,
        end_byte: 10,
    }
}

#[test]
fn test_unit_id_changes_with_text() {
    let a = UnitId::from_content("src/a.py", "def a(): pass");
    let b = UnitId::from_content("src/a.py", "def a(): return 1");
    assert_ne!(a, b);
}

#[test]
fn test_unit_id_stable_for_same_content() {
    let a = UnitId::from_content("src/a.py", "def a(): pass");
    let b = UnitId::from_content("src/a.py", "def a(): pass");
    assert_eq!(a, b);
    assert_eq!(a.as_str().len(), 64);
}

#[test]
fn test_unit_id_includes_path() {
    let a = UnitId::from_content("a.py", "same text");
    let b = UnitId::from_content("b.py", "same text");
    assert_ne!(a, b);
}

#[test]
fn test_unit_id_path_text_boundary() {
    // "ab" + "c" must not collide with "a" + "bc"
    let a = UnitId::from_content("ab", "c");
    let b = UnitId::from_content("a", "bc");
    assert_ne!(a, b);
}

#[test]
fn test_unit_id_short() {
    let id = UnitId::from_content("a.py", "x");
    assert_eq!(id.short().len(), 12);
    assert!(id.as_str().starts_with(id.short()));
}

#[test]
fn test_unit_new_derives_id() {
    let unit = Unit::new("a.py", span(1, 3), "x = 1\n", "filehash");
    assert_eq!(unit.id, UnitId::from_content("a.py", "x = 1\n"));
    assert_eq!(unit.source_path, "a.py");
    assert_eq!(unit.file_hash, "filehash");
}

#[test]
fn test_embedded_unit_serialization_flattens() {
    let unit = Unit::new("a.py", span(1, 1), "x", "h");
    let embedded = EmbeddedUnit::new(unit.clone(), vec![1.0, 0.0]);
    let json = serde_json::to_value(&embedded).unwrap();

    assert_eq!(json["source_path"], "a.py");
    assert_eq!(json["id"], unit.id.as_str());
    assert_eq!(json["vector"].as_array().unwrap().len(), 2);

    let back: EmbeddedUnit = serde_json::from_value(json).unwrap();
    assert_eq!(back, embedded);
}

#[test]
fn test_sync_point_display() {
    let point = SyncPoint::new("HEAD", "0123456789abcdef0123");
    assert_eq!(point.to_string(), "HEAD@0123456789ab");
    assert_eq!(
        point.clone().incomplete().to_string(),
        "HEAD@0123456789ab (incomplete)"
    );
}

#[test]
fn test_sync_point_same_revision_ignores_completeness() {
    let a = SyncPoint::new("HEAD", "abc");
    let b = SyncPoint::new("main", "abc").incomplete();
    assert!(a.same_revision(&b));
    assert_ne!(a, b);
}

#[test]
fn test_snippet_prompt_string() {
    let snippet = Snippet {
        source_path: "src/lib.rs".to_string(),
        span: span(10, 20),
        text: "pub fn f() {}".to_string(),
        score: 0.9,
    };
    assert_eq!(
        snippet.to_prompt_string(),
        "----src/lib.rs: l.10 to l.20-----\npub fn f() {}"
    );
}

#[test]
fn test_snippet_from_hit() {
    let unit = Unit::new("b.py", span(2, 4), "print()", "h");
    let snippet = Snippet::from(SearchHit {
        unit: unit.clone(),
        score: 0.5,
    });
    assert_eq!(snippet.source_path, "b.py");
    assert_eq!(snippet.span, unit.span);
    assert_eq!(snippet.text, "print()");
    assert_eq!(snippet.score, 0.5);
}

#[test]
fn test_skip_reason_serialization() {
    let json = serde_json::to_string(&SkipReason::NotUtf8).unwrap();
    assert_eq!(json, "\"not_utf8\"");
    assert_eq!(SkipReason::Binary.to_string(), "binary");
}

#[test]
fn test_sync_report_round_trip() {
    let report = SyncReport {
        sync_point: SyncPoint::new("HEAD", "abc"),
        mode: SyncMode::Incremental,
        units_total: 5,
        units_added: 1,
        units_removed: 2,
        units_unchanged: 4,
        skipped: vec![SkippedFile {
            path: "logo.png".to_string(),
            reason: SkipReason::Binary,
        }],
        duration_ms: 12,
    };
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"mode\":\"incremental\""));
    let back: SyncReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back, report);
}
