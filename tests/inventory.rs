use std::fs;

use camino::Utf8PathBuf;
use sat_archive::inventory;

fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

#[test]
fn mixed_naming_conventions_collapse_onto_one_grid() {
    let temp = tempfile::tempdir().unwrap();
    // Same capture, three vintages of naming; plus two files that are not
    // frames at all.
    fs::write(temp.path().join("goes16_geocolor_202608231950.png"), b"a").unwrap();
    fs::write(
        temp.path().join("20262351950_GOES16-ABI-FD-GEOCOLOR.jpg"),
        b"b",
    )
    .unwrap();
    fs::write(temp.path().join("capture-2026-08-23T20-00.png"), b"c").unwrap();
    fs::write(temp.path().join("thumbs.db"), b"junk").unwrap();
    fs::write(temp.path().join("goes16_geocolor_latest.png"), b"junk").unwrap();

    let scan = inventory::scan(&utf8(temp.path())).unwrap();
    let stamps: Vec<String> = scan.sorted().iter().map(|ts| ts.compact()).collect();
    assert_eq!(stamps, vec!["202608231950", "202608232000"]);
    assert_eq!(scan.skipped, 2);
}

#[test]
fn scan_descends_into_subdirectories() {
    let temp = tempfile::tempdir().unwrap();
    let nested = temp.path().join("2026").join("08");
    fs::create_dir_all(&nested).unwrap();
    fs::write(temp.path().join("goes16_geocolor_202608230000.png"), b"a").unwrap();
    fs::write(nested.join("goes16_geocolor_202608230010.png"), b"b").unwrap();

    let scan = inventory::scan(&utf8(temp.path())).unwrap();
    assert_eq!(scan.found.len(), 2);
    assert_eq!(scan.skipped, 0);
}

#[test]
fn missing_directory_is_an_empty_inventory() {
    let temp = tempfile::tempdir().unwrap();
    let scan = inventory::scan(&utf8(&temp.path().join("never-created"))).unwrap();
    assert!(scan.found.is_empty());
    assert_eq!(scan.skipped, 0);
}
