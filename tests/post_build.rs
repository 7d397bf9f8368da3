use std::fs;
use std::path::{Path, PathBuf};

use fwpack::control;
use fwpack::node::Node;
use fwpack::state::BuildContext;

const U_BOOT_DATA: &[u8] = b"1234";
const TEXT_DATA: &[u8] = b"some text";

const REPACK_DESC: &str = r#"
    [binman]
    allow-repack = true
    [binman.image-header]
    location = "start"
    [binman.u-boot]
    [binman.section]
    [binman.section.text]
    text = "some text"
    [binman.fdtmap]
"#;

/// Builds `description` into a scratch directory and returns the directory
/// and the path of the image file.
fn build_image(description: &str) -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::tempdir().expect("tempdir");
    fs::write(tmp.path().join("u-boot.bin"), U_BOOT_DATA).expect("write u-boot");
    let mut ctx = BuildContext::new();
    ctx.input_dirs = vec![tmp.path().to_path_buf()];
    let root = Node::parse(description).expect("description");
    control::build_images(&root, &mut ctx, &[], tmp.path(), false).expect("build");
    let image = tmp.path().join("image.bin");
    (tmp, image)
}

fn names(image: &Path, patterns: &[&str]) -> Vec<String> {
    let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
    control::list_entries(image, &patterns)
        .expect("list")
        .into_iter()
        .map(|row| row.name)
        .collect()
}

#[test]
fn list_all_and_by_pattern() {
    let (_tmp, image) = build_image(REPACK_DESC);
    assert_eq!(
        names(&image, &[]),
        ["main-section", "image-header", "u-boot", "section", "text", "fdtmap"]
    );
    assert_eq!(names(&image, &["section"]), ["section", "text"]);
    assert_eq!(names(&image, &["*u-boot*", "*head*"]), ["image-header", "u-boot"]);
    assert!(names(&image, &["nothing"]).is_empty());

    let rows = control::list_entries(&image, &[]).unwrap();
    let text = rows.iter().find(|r| r.name == "text").unwrap();
    assert_eq!((text.indent, text.offset, text.image_pos), (2, Some(0), Some(12)));
    assert_eq!(text.path, "section/text");

    let listing = control::format_listing(&rows);
    let lines: Vec<&str> = listing.lines().collect();
    assert!(lines[0].starts_with("Name"));
    assert!(lines[0].ends_with("Uncomp-size"));
    assert!(lines[1].chars().all(|c| c == '-'));
    assert!(lines[3].starts_with("  image-header"));
    assert!(lines[6].starts_with("    text"));
}

#[test]
fn listing_needs_an_fdtmap() {
    let (_tmp, image) = build_image("[binman.u-boot]\n");
    let err = control::list_entries(&image, &[]).unwrap_err();
    assert_eq!(err.to_string(), "Cannot find FDT map in image");
}

#[test]
fn bad_pattern() {
    let (_tmp, image) = build_image(REPACK_DESC);
    let err = control::list_entries(&image, &["[".to_string()]).unwrap_err();
    assert!(err.to_string().starts_with("Invalid entry pattern '['"));
}

#[test]
fn extract_one_entry() {
    let (_tmp, image) = build_image(REPACK_DESC);
    assert_eq!(control::extract_entry(&image, "u-boot", true).unwrap(), U_BOOT_DATA);
    assert_eq!(control::extract_entry(&image, "section/text", true).unwrap(), TEXT_DATA);
    assert_eq!(control::extract_entry(&image, "section", true).unwrap(), TEXT_DATA);

    let err = control::extract_entry(&image, "section/does-not-exist", true).unwrap_err();
    assert_eq!(err.to_string(), "Entry 'does-not-exist' not found in '/section'");
}

#[test]
fn extract_compressed_entry() {
    let (_tmp, image) = build_image("[binman.u-boot]\ncompress = \"gzip\"\n[binman.fdtmap]\n");
    assert_eq!(control::extract_entry(&image, "u-boot", true).unwrap(), U_BOOT_DATA);
    let raw = control::extract_entry(&image, "u-boot", false).unwrap();
    assert_ne!(raw, U_BOOT_DATA);
    let rows = control::list_entries(&image, &["u-boot".to_string()]).unwrap();
    assert_eq!(rows[0].uncomp_size, Some(4));
    assert_eq!(rows[0].size, Some(raw.len() as u64));
}

#[test]
fn extract_all_entries_to_a_tree() {
    let (tmp, image) = build_image(REPACK_DESC);
    let out = tmp.path().join("extract");
    let rows = control::extract_entries(&image, &[], &out, true).unwrap();
    assert_eq!(rows.len(), 6);

    assert_eq!(fs::read(out.join("__image.bin")).unwrap(), fs::read(&image).unwrap());
    assert_eq!(fs::read(out.join("u-boot")).unwrap(), U_BOOT_DATA);
    assert_eq!(fs::read(out.join("section/__image.bin")).unwrap(), TEXT_DATA);
    assert_eq!(fs::read(out.join("section/text")).unwrap(), TEXT_DATA);
    assert!(fs::read(out.join("fdtmap")).unwrap().starts_with(b"_FDTMAP_"));
    assert!(fs::read(out.join("image-header")).unwrap().starts_with(b"BinM"));
}

#[test]
fn replace_with_same_size() {
    let (_tmp, image) = build_image(REPACK_DESC);
    let before = fs::read(&image).unwrap();
    control::replace_entry(&image, "u-boot", b"abcd".to_vec(), true, false, false).unwrap();
    let after = fs::read(&image).unwrap();
    assert_eq!(after.len(), before.len());
    assert_eq!(&after[8..12], b"abcd");
    assert_eq!(control::extract_entry(&image, "u-boot", true).unwrap(), b"abcd");
    assert_eq!(control::extract_entry(&image, "section/text", true).unwrap(), TEXT_DATA);
}

#[test]
fn replace_with_resize_repacks() {
    let (_tmp, image) = build_image(REPACK_DESC);
    control::replace_entry(&image, "u-boot", b"abcdef".to_vec(), true, true, true).unwrap();
    assert_eq!(control::extract_entry(&image, "u-boot", true).unwrap(), b"abcdef");
    assert_eq!(control::extract_entry(&image, "section/text", true).unwrap(), TEXT_DATA);

    let rows = control::list_entries(&image, &["section".to_string()]).unwrap();
    assert_eq!(rows[0].offset, Some(14));
    assert_eq!(rows[1].image_pos, Some(14));
    assert!(image.with_extension("map").exists());
}

#[test]
fn resize_refused() {
    let (_tmp, image) = build_image(REPACK_DESC);
    let err = control::replace_entry(&image, "u-boot", b"abcdef".to_vec(), true, false, false).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Node '/binman/u-boot': Entry data size does not match, but resize is disabled"
    );

    let (_tmp, image) = build_image("[binman.u-boot]\n[binman.fdtmap]\n");
    let err = control::replace_entry(&image, "u-boot", b"abcdef".to_vec(), true, true, false).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Node '/binman/u-boot': Entry data size does not match, but allow-repack is not present for this image"
    );
}

#[test]
fn replace_from_a_directory() {
    let (tmp, image) = build_image(REPACK_DESC);
    let indir = tmp.path().join("replace");
    fs::create_dir_all(indir.join("section")).unwrap();
    fs::write(indir.join("u-boot"), b"wxyz").unwrap();
    fs::write(indir.join("section/text"), b"new text!").unwrap();

    control::replace_entries(&image, &indir, &[], true, true, false).unwrap();
    assert_eq!(control::extract_entry(&image, "u-boot", true).unwrap(), b"wxyz");
    assert_eq!(control::extract_entry(&image, "section/text", true).unwrap(), b"new text!");

    fs::write(indir.join("u-boot"), b"1111").unwrap();
    control::replace_entries(&image, &indir, &["section".to_string()], true, true, false).unwrap();
    assert_eq!(control::extract_entry(&image, "u-boot", true).unwrap(), b"wxyz");
}

#[test]
fn replace_compressed_entry() {
    let (_tmp, image) = build_image("[binman]\nallow-repack = true\n[binman.u-boot]\ncompress = \"lzma\"\n[binman.fdtmap]\n");
    control::replace_entry(&image, "u-boot", b"a longer replacement".to_vec(), true, true, false).unwrap();
    assert_eq!(
        control::extract_entry(&image, "u-boot", true).unwrap(),
        b"a longer replacement"
    );
    let rows = control::list_entries(&image, &["u-boot".to_string()]).unwrap();
    assert_eq!(rows[0].uncomp_size, Some(20));
}
