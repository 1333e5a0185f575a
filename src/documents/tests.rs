use super::*;
use std::fs;
use tempfile::TempDir;

fn page(source: &str, page_number: u32, text: &str) -> PageText {
    PageText {
        source_path: source.to_string(),
        page_number,
        text: text.to_string(),
    }
}

fn small_splitter() -> TextSplitter {
    TextSplitter::new(&ChunkingConfig {
        chunk_size: 40,
        chunk_overlap: 10,
    })
    .expect("valid splitter config")
}

#[test]
fn split_pages_keeps_page_provenance() {
    let pages = vec![
        page("a.pdf", 0, "Cathode materials include NCM and LFP."),
        page("a.pdf", 2, "Anodes are usually graphite."),
    ];

    let chunks = split_pages(&pages, &small_splitter());

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].page_number, 0);
    assert_eq!(chunks[0].text, "Cathode materials include NCM and LFP.");
    assert_eq!(chunks[1].page_number, 2);
    assert!(chunks.iter().all(|c| c.source_path == "a.pdf"));
}

#[test]
fn split_pages_never_spans_pages() {
    let pages = vec![page("a.pdf", 0, "short one"), page("a.pdf", 1, "short two")];

    let chunks = split_pages(&pages, &small_splitter());

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].text, "short one");
    assert_eq!(chunks[1].text, "short two");
}

#[test]
fn split_pages_skips_blank_pages() {
    let pages = vec![
        page("a.pdf", 0, "   \n\t "),
        page("a.pdf", 1, "Solid electrolytes."),
    ];

    let chunks = split_pages(&pages, &small_splitter());

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].page_number, 1);
}

#[test]
fn long_page_yields_multiple_bounded_chunks() {
    let text = "Lithium plating occurs at low temperatures. ".repeat(10);
    let pages = vec![page("b.pdf", 4, &text)];

    let chunks = split_pages(&pages, &small_splitter());

    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(chunk.text.chars().count() <= 40);
        assert_eq!(chunk.page_number, 4);
    }
}

#[test]
fn discover_pdfs_is_recursive_sorted_and_case_insensitive() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let root = temp_dir.path();
    fs::create_dir_all(root.join("nested/deeper")).expect("should create dirs");

    fs::write(root.join("b.pdf"), b"x").expect("write");
    fs::write(root.join("a.PDF"), b"x").expect("write");
    fs::write(root.join("notes.txt"), b"x").expect("write");
    fs::write(root.join("nested/c.pdf"), b"x").expect("write");
    fs::write(root.join("nested/deeper/d.Pdf"), b"x").expect("write");
    fs::write(root.join("nested/pdf"), b"x").expect("write");

    let found = discover_pdfs(root);
    let names: Vec<_> = found
        .iter()
        .map(|p| {
            p.strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();

    assert_eq!(
        names,
        vec!["a.PDF", "b.pdf", "nested/c.pdf", "nested/deeper/d.Pdf"]
    );
}

#[test]
fn discover_pdfs_is_stable() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    for name in ["z.pdf", "m.pdf", "a.pdf"] {
        fs::write(temp_dir.path().join(name), b"x").expect("write");
    }

    assert_eq!(discover_pdfs(temp_dir.path()), discover_pdfs(temp_dir.path()));
}

#[test]
fn missing_path_is_reported() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let missing = temp_dir.path().join("does-not-exist");

    let result = DocumentLoader::new(&missing).load_pages();
    match result {
        Err(QaError::PathNotFound(path)) => assert_eq!(path, missing),
        other => panic!("expected PathNotFound, got {other:?}"),
    }
}

#[test]
fn corrupt_single_file_is_an_extraction_error() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let bad = temp_dir.path().join("broken.pdf");
    fs::write(&bad, b"this is not a pdf").expect("write");

    let result = DocumentLoader::new(&bad).load_pages();
    assert!(matches!(result, Err(QaError::Extraction(_))));
}

#[test]
fn corrupt_file_in_directory_is_skipped() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    fs::write(temp_dir.path().join("broken.pdf"), b"%PDF-garbage").expect("write");

    let pages = DocumentLoader::new(temp_dir.path())
        .load_pages()
        .expect("directory load should tolerate bad files");
    assert!(pages.is_empty());
}

#[test]
fn empty_directory_loads_nothing() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");

    let chunks = load_and_split(temp_dir.path(), 1000, 200).expect("should load");
    assert!(chunks.is_empty());
}

#[test]
fn invalid_chunking_is_rejected_before_loading() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");

    let result = load_and_split(temp_dir.path(), 100, 150);
    assert!(matches!(result, Err(QaError::Config(_))));
}
