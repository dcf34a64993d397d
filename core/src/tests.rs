//! Engine-level tests over in-memory storage

use super::*;
use pretty_assertions::assert_eq;

const WORDS: IndexId<String, u32> = IndexId::new("words");
const LINES: IndexId<u32, u32> = IndexId::new("lines");

fn count_words(content: &FileContent) -> std::result::Result<InputData<String, u32>, IndexerError> {
    let mut data = InputData::new();
    for word in content.text().ok_or("not utf-8")?.split_whitespace() {
        *data.entry(word.to_string()).or_insert(0) += 1;
    }
    Ok(data)
}

fn count_lines(content: &FileContent) -> std::result::Result<InputData<u32, u32>, IndexerError> {
    let lines = content.text().map_or(0, |text| text.lines().count());
    Ok(InputData::from([(u32::try_from(lines)?, 1)]))
}

fn definitions() -> Vec<Box<dyn IndexDefinition>> {
    vec![
        IndexExtension::new(WORDS, 1, count_words)
            .with_input_filter(FileTypeFilter::new([FileType::new("txt")]))
            .boxed(),
        IndexExtension::new(LINES, 1, count_lines).boxed(),
    ]
}

fn in_memory() -> FileBasedIndex {
    let config = EngineConfig {
        persistent: false,
        ..EngineConfig::default()
    };
    FileBasedIndex::open(config, definitions()).unwrap()
}

fn txt(id: FileId, body: &str) -> FileContent {
    FileContent::new(id, FileType::new("txt"), body.as_bytes().to_vec())
}

fn word(s: &str) -> String {
    s.to_string()
}

#[test]
fn test_changes_become_visible_to_queries() {
    let engine = in_memory();
    let context = engine.access_context();
    engine.updater().changes().file_changed(txt(1, "hello world"));
    engine.updater().changes().file_changed(txt(2, "hello\nagain"));

    let files = engine
        .query()
        .get_containing_files(&WORDS, &word("hello"), &SearchScope::everything(), &context)
        .unwrap();
    assert_eq!(files, vec![1, 2]);
    assert_eq!(engine.updater().changes().pending_count(), 0);

    let two_lines = engine
        .query()
        .get_containing_files(&LINES, &2, &SearchScope::everything(), &context)
        .unwrap();
    assert_eq!(two_lines, vec![2]);
}

#[test]
fn test_type_filter_routes_files() {
    let engine = in_memory();
    let context = engine.access_context();
    let markdown = FileContent::new(3, FileType::new("md"), b"hello".to_vec());
    engine.updater().changes().file_changed(markdown);

    let words = engine
        .query()
        .get_containing_files(&WORDS, &word("hello"), &SearchScope::everything(), &context)
        .unwrap();
    assert!(words.is_empty());
    assert_eq!(
        engine.registry().applicable_indexes(&FileType::new("md")),
        &["lines"]
    );
    let data = engine.query().get_file_data(&LINES, 3, &context).unwrap();
    assert_eq!(data, InputData::from([(1, 1)]));
}

#[test]
fn test_late_registration_is_rejected() {
    let engine = in_memory();
    let late = IndexExtension::new(IndexId::<String, u32>::new("late"), 1, count_words);
    let err = engine.register_extension(late.boxed()).unwrap_err();
    assert!(matches!(
        err,
        IndexError::Registration(RegistrationError::FrozenRegistry(ref name)) if name == "late"
    ));
    assert!(!engine.registry().contains("late"));
}

#[test]
fn test_duplicate_definition_is_reported() {
    let mut definitions = definitions();
    definitions.push(IndexExtension::new(WORDS, 2, count_words).boxed());
    let config = EngineConfig {
        persistent: false,
        ..EngineConfig::default()
    };
    let engine = FileBasedIndex::open(config, definitions).unwrap();

    assert_eq!(engine.registry().ids(), &["words", "lines"]);
    assert_eq!(engine.registry().version("words").unwrap(), 1);
    let problems = engine.registry().initialization_problems();
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].0, "words");
}

#[test]
fn test_rebuild_clears_index() {
    let engine = in_memory();
    let context = engine.access_context();
    let file = txt(1, "alpha");
    engine.updater().index_file_content(&file).unwrap();

    assert!(engine.rebuild_coordinator().request_rebuild("words", "manual"));
    let during = engine
        .query()
        .get_containing_files(&WORDS, &word("alpha"), &SearchScope::everything(), &context)
        .unwrap();
    assert!(during.is_empty());
    assert!(engine.rebuild_coordinator().has_pending_requests());

    assert_eq!(engine.process_pending_rebuilds().unwrap(), vec!["words".to_string()]);
    assert!(!engine.rebuild_coordinator().has_pending_requests());
    assert!(engine.process_pending_rebuilds().unwrap().is_empty());
    assert_eq!(engine.rebuild_coordinator().status("words"), RebuildStatus::Ok);
    let words = engine.registry().index(&WORDS).unwrap();
    assert_eq!(words.indexing_state(&file.snapshot()), FileIndexingState::NotIndexed);

    engine.updater().changes().file_changed(file);
    let after = engine
        .query()
        .get_containing_files(&WORDS, &word("alpha"), &SearchScope::everything(), &context)
        .unwrap();
    assert_eq!(after, vec![1]);
}

#[test]
fn test_shutdown_cancels_contexts() {
    let engine = in_memory();
    let context = engine.access_context();
    engine.shutdown().unwrap();

    assert!(context.is_cancelled());
    let err = engine
        .query()
        .get_all_keys(&WORDS, &context)
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(engine.rebuild_coordinator().requested_count(), 0);
}

#[test]
fn test_skipped_checks_read_stale_data() {
    let engine = in_memory();
    let context = engine.access_context();
    engine.updater().changes().file_changed(txt(1, "fresh"));

    let stale = {
        let _skip = context.skip_up_to_date_checks();
        engine
            .query()
            .get_containing_files(&WORDS, &word("fresh"), &SearchScope::everything(), &context)
            .unwrap()
    };
    assert!(stale.is_empty());
    assert_eq!(engine.updater().changes().pending_count(), 1);

    let fresh = engine
        .query()
        .get_containing_files(&WORDS, &word("fresh"), &SearchScope::everything(), &context)
        .unwrap();
    assert_eq!(fresh, vec![1]);
}

#[test]
fn test_predicate_filter_and_invalidation() {
    let vendored = ProjectId::new("vendored");
    let skip_vendored = {
        let vendored = vendored.clone();
        PredicateFilter(move |_: &FileContent, project: Option<&ProjectId>| {
            project != Some(&vendored)
        })
    };
    let definitions = vec![
        IndexExtension::new(WORDS, 1, count_words)
            .with_input_filter(skip_vendored)
            .boxed(),
    ];
    let config = EngineConfig {
        persistent: false,
        ..EngineConfig::default()
    };
    let engine = FileBasedIndex::open(config, definitions).unwrap();
    let context = engine.access_context();

    let own = txt(1, "kept");
    engine.updater().changes().file_changed(own.clone());
    engine
        .updater()
        .changes()
        .file_changed(txt(2, "kept").with_project(vendored));
    let files = engine
        .query()
        .get_containing_files(&WORDS, &word("kept"), &SearchScope::everything(), &context)
        .unwrap();
    assert_eq!(files, vec![1]);

    let words = engine.registry().erased("words").unwrap();
    words.invalidate_indexed_state(1);
    assert_eq!(words.indexing_state(&own.snapshot()), FileIndexingState::OutDated);
    engine.updater().index_file_content(&own).unwrap();
    assert_eq!(words.indexing_state(&own.snapshot()), FileIndexingState::UpToDate);
}
