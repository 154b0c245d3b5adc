use indoc::indoc;
use npatch::{
    patch, patch_str, BodyEvent, HunkKind, HunkLexer, ParseOutcome, PatchError, PatchOptions,
    Section,
};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor};
use tempfile::tempdir;

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn apply(original: &str, diff: &str) -> Result<String, PatchError> {
    patch_str(original, diff, &PatchOptions::builder().quiet(true).build())
}

// --- End-to-End Application Tests ---

#[test]
fn test_empty_diff_is_identity() {
    setup();
    let original = "line 1\nline 2\nline 3\n";
    assert_eq!(apply(original, "").unwrap(), original);
}

#[test]
fn test_empty_diff_on_empty_original() {
    setup();
    assert_eq!(apply("", "").unwrap(), "");
}

#[test]
fn test_delete_hunk_removes_declared_range() {
    setup();
    let original = indoc! {"
        line 1
        line 2
        line 3
        line 4
        line 5
        line 6
        line 7
        line 8
    "};
    let diff = indoc! {"
        5,7d4
        < line 5
        < line 6
        < line 7
    "};
    let expected = indoc! {"
        line 1
        line 2
        line 3
        line 4
        line 8
    "};
    assert_eq!(apply(original, diff).unwrap(), expected);
}

#[test]
fn test_delete_first_line() {
    setup();
    assert_eq!(apply("a\nb\nc\n", "1d0\n< a\n").unwrap(), "b\nc\n");
}

#[test]
fn test_delete_last_line() {
    setup();
    assert_eq!(apply("a\nb\nc\n", "3d2\n< c\n").unwrap(), "a\nb\n");
}

#[test]
fn test_append_inserts_after_anchor_line() {
    setup();
    let original = indoc! {"
        line 1
        line 2
        line 3
        line 4
        line 5
    "};
    let diff = indoc! {"
        3a4,5
        > inserted A
        > inserted B
    "};
    let expected = indoc! {"
        line 1
        line 2
        line 3
        inserted A
        inserted B
        line 4
        line 5
    "};
    assert_eq!(apply(original, diff).unwrap(), expected);
}

#[test]
fn test_append_before_first_line() {
    setup();
    assert_eq!(
        apply("a\nb\n", "0a1\n> new first\n").unwrap(),
        "new first\na\nb\n"
    );
}

#[test]
fn test_append_into_empty_original() {
    setup();
    assert_eq!(apply("", "0a1\n> only line\n").unwrap(), "only line\n");
}

#[test]
fn test_change_replaces_single_line() {
    setup();
    let diff = indoc! {"
        2c2
        < beta
        ---
        > BETA
    "};
    assert_eq!(
        apply("alpha\nbeta\ngamma\n", diff).unwrap(),
        "alpha\nBETA\ngamma\n"
    );
}

#[test]
fn test_change_deletions_consumed_before_additions_emitted() {
    setup();
    // The replaced lines must not leak into the output, and the additions
    // must land exactly where the deletions were.
    let diff = indoc! {"
        2,3c2,4
        < b
        < c
        ---
        > X
        > Y
        > Z
    "};
    assert_eq!(apply("a\nb\nc\nd\n", diff).unwrap(), "a\nX\nY\nZ\nd\n");
}

#[test]
fn test_change_shrinking_line_count() {
    setup();
    let diff = indoc! {"
        2,3c2
        < b
        < c
        ---
        > X
    "};
    assert_eq!(apply("a\nb\nc\nd\n", diff).unwrap(), "a\nX\nd\n");
}

#[test]
fn test_multiple_hunks_apply_in_order() {
    setup();
    let diff = indoc! {"
        1d0
        < a
        3a3
        > X
    "};
    assert_eq!(apply("a\nb\nc\nd\n", diff).unwrap(), "b\nc\nX\nd\n");
}

#[test]
fn test_mixed_hunk_kinds_in_one_diff() {
    setup();
    let original = indoc! {"
        one
        two
        three
        four
        five
    "};
    let diff = indoc! {"
        2c2
        < two
        ---
        > TWO
        4d3
        < four
        5a5
        > six
    "};
    let expected = indoc! {"
        one
        TWO
        three
        five
        six
    "};
    assert_eq!(apply(original, diff).unwrap(), expected);
}

#[test]
fn test_many_generated_append_hunks() {
    setup();
    // Insert one new line after each original line; hunk i reads "ia2i".
    let count = 50;
    let mut original = String::new();
    let mut diff = String::new();
    let mut expected = String::new();
    for i in 1..=count {
        original.push_str(&format!("line {}\n", i));
        diff.push_str(&format!("{}a{}\n> inserted {}\n", i, 2 * i, i));
        expected.push_str(&format!("line {}\ninserted {}\n", i, i));
    }
    assert_eq!(apply(&original, &diff).unwrap(), expected);
}

// --- Trailing Newline Tolerance ---

#[test]
fn test_diff_missing_trailing_newline() {
    setup();
    let diff = "2c2\n< b\n---\n> B";
    assert_eq!(apply("a\nb\nc\n", diff).unwrap(), "a\nB\nc\n");
}

#[test]
fn test_original_missing_trailing_newline() {
    setup();
    let diff = indoc! {"
        2d1
        < b
    "};
    assert_eq!(apply("a\nb", diff).unwrap(), "a\n");
}

#[test]
fn test_append_after_unterminated_last_line() {
    setup();
    // The anchor line keeps its own (synthesized) terminator; the appended
    // line must not be glued onto it.
    assert_eq!(apply("a", "1a2\n> x\n").unwrap(), "a\nx\n");
    assert_eq!(apply("a\nb", "2a3\n> x\n").unwrap(), "a\nb\nx\n");
}

#[test]
fn test_change_of_unterminated_last_line() {
    setup();
    let diff = indoc! {"
        2c2
        < b
        ---
        > B
    "};
    assert_eq!(apply("a\nb", diff).unwrap(), "a\nB\n");
}

// --- Content Verification ---

#[test]
fn test_deletion_mismatch_is_detected() {
    setup();
    let diff = indoc! {"
        2d1
        < not what line two says
    "};
    let err = apply("a\nb\nc\n", diff).unwrap_err();
    assert!(matches!(err, PatchError::ContentMismatch { serial: 1 }));
}

#[test]
fn test_mismatch_reports_offending_hunk_serial() {
    setup();
    let diff = indoc! {"
        1d0
        < a
        3d1
        < WRONG
    "};
    let err = apply("a\nb\nc\nd\n", diff).unwrap_err();
    assert!(matches!(err, PatchError::ContentMismatch { serial: 2 }));
    assert_eq!(err.serial(), Some(2));
}

#[test]
fn test_original_exhausted_mid_deletion() {
    setup();
    let diff = indoc! {"
        2d1
        < b
    "};
    let err = apply("a\n", diff).unwrap_err();
    assert!(matches!(err, PatchError::ContentMismatch { serial: 1 }));
}

#[test]
fn test_hunk_anchored_past_end_of_original() {
    setup();
    // The original has nowhere near line 5; the pass-through copy runs out
    // of input before the hunk's anchor is reached.
    let err = apply("a\nb\n", "5a6\n> x\n").unwrap_err();
    assert!(matches!(err, PatchError::ContentMismatch { serial: 1 }));

    let err = apply("a\n", "5d4\n< x\n").unwrap_err();
    assert!(matches!(err, PatchError::ContentMismatch { serial: 1 }));
}

#[test]
fn test_line_ending_bytes_are_significant() {
    setup();
    // A CRLF original does not match an LF deletion line.
    let err = apply("a\r\nb\n", "1d0\n< a\n").unwrap_err();
    assert!(matches!(err, PatchError::ContentMismatch { serial: 1 }));
}

// --- Line-Count Bookkeeping ---

#[test]
fn test_deletion_body_longer_than_declared_range() {
    setup();
    let diff = indoc! {"
        2d1
        < b
        < c
    "};
    let err = apply("a\nb\nc\nd\n", diff).unwrap_err();
    assert!(matches!(err, PatchError::LineCountMismatch { serial: 1 }));
}

#[test]
fn test_new_range_disagrees_with_additions() {
    setup();
    let diff = indoc! {"
        1a5
        > X
    "};
    let err = apply("a\nb\nc\nd\ne\n", diff).unwrap_err();
    assert!(matches!(err, PatchError::LineCountMismatch { serial: 1 }));
}

// --- Malformed Diff Rejection ---

#[test]
fn test_header_with_space_is_rejected() {
    setup();
    let mut out = Vec::new();
    let err = patch(
        "a\nb\n".as_bytes(),
        &mut out,
        "5,7 9\n< x\n".as_bytes(),
        &PatchOptions::builder().quiet(true).build(),
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::MalformedDiff { serial: 1 }));
    // Rejected before any of the hunk was applied.
    assert!(out.is_empty());
}

#[test]
fn test_header_missing_numbers() {
    setup();
    for diff in ["a3\n", "5a\n", "5,a6\n", "nonsense\n"] {
        let err = apply("a\n", diff).unwrap_err();
        assert!(
            matches!(err, PatchError::MalformedDiff { serial: 1 }),
            "diff {:?} should be rejected",
            diff
        );
    }
}

#[test]
fn test_inverted_ranges_are_rejected() {
    setup();
    for diff in ["7,5d4\n< x\n", "1a5,2\n> x\n"] {
        let err = apply("a\nb\nc\nd\ne\nf\ng\n", diff).unwrap_err();
        assert!(
            matches!(err, PatchError::MalformedDiff { serial: 1 }),
            "diff {:?} should be rejected",
            diff
        );
    }
}

#[test]
fn test_truncated_header_at_end_of_input() {
    setup();
    let err = apply("a\n", "5a").unwrap_err();
    assert!(matches!(err, PatchError::MalformedDiff { serial: 1 }));
}

#[test]
fn test_bad_body_prefix() {
    setup();
    let err = apply("a\nb\n", "1d0\n<x\n").unwrap_err();
    assert!(matches!(err, PatchError::MalformedDiff { serial: 1 }));
}

#[test]
fn test_addition_prefix_in_delete_hunk() {
    setup();
    let err = apply("a\nb\n", "1d0\n> a\n").unwrap_err();
    assert!(matches!(err, PatchError::MalformedDiff { serial: 1 }));
}

#[test]
fn test_separator_outside_change_hunk() {
    setup();
    let err = apply("a\nb\n", "1d0\n< a\n---\n").unwrap_err();
    assert!(matches!(err, PatchError::MalformedDiff { serial: 1 }));
}

#[test]
fn test_change_hunk_without_addition_section() {
    setup();
    let err = apply("a\nb\n", "1c1\n< a\n").unwrap_err();
    assert!(matches!(err, PatchError::MalformedDiff { serial: 1 }));
}

#[test]
fn test_deletion_prefix_after_separator() {
    setup();
    let diff = indoc! {"
        1c1
        < a
        ---
        > X
        < b
    "};
    let err = apply("a\nb\n", diff).unwrap_err();
    assert!(matches!(err, PatchError::MalformedDiff { serial: 1 }));
}

// --- Dry Run ---

#[test]
fn test_dry_run_writes_nothing() {
    setup();
    let options = PatchOptions::builder().dry_run(true).quiet(true).build();
    let mut out = Vec::new();
    patch(
        "a\nb\nc\n".as_bytes(),
        &mut out,
        "2d1\n< b\n".as_bytes(),
        &options,
    )
    .unwrap();
    assert!(out.is_empty());
}

#[test]
fn test_dry_run_still_detects_errors() {
    setup();
    let options = PatchOptions::builder().dry_run(true).quiet(true).build();
    let mut out = Vec::new();
    let err = patch(
        "a\nb\nc\n".as_bytes(),
        &mut out,
        "2d1\n< WRONG\n".as_bytes(),
        &options,
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::ContentMismatch { serial: 1 }));
    assert!(out.is_empty());
}

// --- Lexer-Level Tests ---

#[test]
fn test_lexer_parses_header_fields() {
    setup();
    let mut lexer = HunkLexer::new(Cursor::new("5,7c5,8\n< x\n---\n> y\n"));
    let hunk = lexer.next_hunk().unwrap();
    assert_eq!(hunk.kind, HunkKind::Change);
    assert_eq!((hunk.old_range.start, hunk.old_range.end), (5, 7));
    assert_eq!((hunk.new_range.start, hunk.new_range.end), (5, 8));
    assert_eq!(hunk.serial, 1);
    assert_eq!(hunk.to_string(), "5,7c5,8");
}

#[test]
fn test_lexer_single_number_range() {
    setup();
    let mut lexer = HunkLexer::new(Cursor::new("3a4\n> x\n"));
    let hunk = lexer.next_hunk().unwrap();
    assert_eq!((hunk.old_range.start, hunk.old_range.end), (3, 3));
    assert_eq!((hunk.new_range.start, hunk.new_range.end), (4, 4));
    assert_eq!(hunk.to_string(), "3a4");
}

#[test]
fn test_lexer_serials_increment_and_stream_ends() {
    setup();
    // next_hunk discards the previous body, so headers can be pulled
    // without reading any body characters.
    let mut lexer = HunkLexer::new(Cursor::new("1d0\n< a\n5d4\n< e\n"));
    assert_eq!(lexer.next_hunk().unwrap().serial, 1);
    let second = lexer.next_hunk().unwrap();
    assert_eq!(second.serial, 2);
    assert_eq!(second.old_range.start, 5);
    assert_eq!(lexer.next_hunk().unwrap_err(), ParseOutcome::EndOfInput);
}

#[test]
fn test_lexer_body_event_sequence_for_change_hunk() {
    setup();
    let mut lexer = HunkLexer::new(Cursor::new("1c1\n< ab\n---\n> C\n"));
    let hunk = lexer.next_hunk().unwrap();

    let mut events = Vec::new();
    loop {
        let event = lexer.next_body_char(&hunk);
        events.push(event);
        if event == BodyEvent::Malformed {
            break;
        }
    }
    assert_eq!(
        events,
        vec![
            BodyEvent::Char(Section::Deletion, b'a'),
            BodyEvent::Char(Section::Deletion, b'b'),
            BodyEvent::Char(Section::Deletion, b'\n'),
            BodyEvent::EndOfSection,
            BodyEvent::Char(Section::Addition, b'C'),
            BodyEvent::Char(Section::Addition, b'\n'),
            BodyEvent::EndOfSection,
            BodyEvent::Malformed,
        ]
    );
    // The error is sticky until the next successful next_hunk.
    assert_eq!(lexer.next_body_char(&hunk), BodyEvent::Malformed);
    assert_eq!(lexer.next_body_char(&hunk), BodyEvent::Malformed);
}

#[test]
fn test_lexer_synthesizes_final_newline_once() {
    setup();
    let mut lexer = HunkLexer::new(Cursor::new("0a1\n> x"));
    let hunk = lexer.next_hunk().unwrap();
    assert_eq!(
        lexer.next_body_char(&hunk),
        BodyEvent::Char(Section::Addition, b'x')
    );
    assert_eq!(
        lexer.next_body_char(&hunk),
        BodyEvent::Char(Section::Addition, b'\n')
    );
    assert_eq!(lexer.next_body_char(&hunk), BodyEvent::EndOfSection);
    assert_eq!(lexer.next_body_char(&hunk), BodyEvent::Malformed);
}

#[test]
fn test_render_change_hunk() {
    setup();
    let mut lexer = HunkLexer::new(Cursor::new("2c2\n< old\n---\n> new\n"));
    let hunk = lexer.next_hunk().unwrap();
    while lexer.next_body_char(&hunk) != BodyEvent::Malformed {}
    assert_eq!(
        lexer.render_hunk(&hunk, true),
        "2c2\n< old\n---\n> new\n"
    );
    assert_eq!(lexer.render_hunk(&hunk, false), "2c2\n");
}

#[test]
fn test_render_marks_capture_overflow() {
    setup();
    // A single body line far beyond the per-line retention limit.
    let long_line = "x".repeat(300);
    let diff = format!("1d0\n< {}\n", long_line);
    let mut lexer = HunkLexer::new(Cursor::new(diff));
    let hunk = lexer.next_hunk().unwrap();
    while lexer.next_body_char(&hunk) != BodyEvent::Malformed {}
    let rendered = lexer.render_hunk(&hunk, true);
    assert!(rendered.starts_with("1d0\n< xxx"));
    assert!(rendered.ends_with("...\n"));
    // The rendering is capped, not the application: far less than the full
    // line must have been retained.
    assert!(rendered.len() < long_line.len());
}

#[test]
fn test_render_marks_section_total_overflow() {
    setup();
    // Many short lines whose combined size exceeds the per-section
    // retention ceiling, without any single line being truncated.
    let count = 80;
    let mut diff = format!("1,{}d0\n", count);
    for _ in 0..count {
        diff.push_str("< abcdefgh\n");
    }
    let mut lexer = HunkLexer::new(Cursor::new(diff));
    let hunk = lexer.next_hunk().unwrap();
    while lexer.next_body_char(&hunk) != BodyEvent::Malformed {}
    let rendered = lexer.render_hunk(&hunk, true);
    assert!(rendered.ends_with("...\n"));
    // Far fewer than the full 80 lines were retained.
    assert!(rendered.lines().count() < count);
}

#[test]
#[should_panic(expected = "no longer current")]
fn test_body_reads_require_current_hunk() {
    setup();
    let mut lexer = HunkLexer::new(Cursor::new("1d0\n< a\n2d1\n< b\n"));
    let stale = lexer.next_hunk().unwrap();
    let _current = lexer.next_hunk().unwrap();
    lexer.next_body_char(&stale);
}

// --- File Stream Plumbing ---

#[test]
fn test_patching_between_files() {
    setup();
    let dir = tempdir().unwrap();
    let original_path = dir.path().join("original.txt");
    let diff_path = dir.path().join("changes.diff");
    let output_path = dir.path().join("patched.txt");

    fs::write(&original_path, "one\ntwo\nthree\n").unwrap();
    fs::write(&diff_path, "2c2\n< two\n---\n> TWO\n").unwrap();

    let original = BufReader::new(File::open(&original_path).unwrap());
    let diff = BufReader::new(File::open(&diff_path).unwrap());
    let output = BufWriter::new(File::create(&output_path).unwrap());

    patch(original, output, diff, &PatchOptions::default()).unwrap();

    assert_eq!(
        fs::read_to_string(&output_path).unwrap(),
        "one\nTWO\nthree\n"
    );
}
