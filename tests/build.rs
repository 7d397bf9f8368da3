use std::fs;
use std::path::PathBuf;

use fwpack::compress::Compression;
use fwpack::control;
use fwpack::elf::{make_elf, ElfSymbol};
use fwpack::fdt::DeviceTree;
use fwpack::format::cbfs::CbfsReader;
use fwpack::format::fdtmap::locate_fdtmap;
use fwpack::format::fmap::decode_fmap;
use fwpack::image::Image;
use fwpack::node::Node;
use fwpack::state::BuildContext;

const U_BOOT_DATA: &[u8] = b"1234";

struct Workspace {
    tmp: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let ws = Workspace {
            tmp: tempfile::tempdir().expect("tempdir"),
        };
        ws.input("u-boot.bin", U_BOOT_DATA);
        ws
    }

    fn in_dir(&self) -> PathBuf {
        self.tmp.path().join("in")
    }

    fn out_dir(&self) -> PathBuf {
        self.tmp.path().join("out")
    }

    fn input(&self, name: &str, data: &[u8]) {
        let path = self.in_dir().join(name);
        fs::create_dir_all(path.parent().expect("parent")).expect("create input dir");
        fs::write(path, data).expect("write input");
    }

    fn context(&self) -> BuildContext {
        let mut ctx = BuildContext::new();
        ctx.input_dirs = vec![self.in_dir()];
        ctx
    }

    fn build_with(&self, description: &str, ctx: &mut BuildContext) -> fwpack::Result<Vec<Image>> {
        let root = Node::parse(description)?;
        control::build_images(&root, ctx, &[], &self.out_dir(), true)
    }

    fn build(&self, description: &str) -> fwpack::Result<Vec<Image>> {
        self.build_with(description, &mut self.context())
    }

    fn output(&self, name: &str) -> Vec<u8> {
        fs::read(self.out_dir().join(name)).expect("read output")
    }
}

fn sym(name: &str, address: u64, size: u64, weak: bool) -> ElfSymbol {
    ElfSymbol {
        name: name.to_string(),
        address,
        size,
        weak,
        section: String::new(),
    }
}

fn le32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(data[pos..pos + 4].try_into().expect("four bytes"))
}

#[test]
fn overlap_names_both_entries() {
    let ws = Workspace::new();
    let err = ws
        .build("[binman._testing]\n[binman.\"_testing@1\"]\noffset = 1\n")
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Node '/binman/_testing@1': Offset 0x1 (1) overlaps with previous entry '/binman/_testing' ending at 0x2 (2)"
    );
}

#[test]
fn aligned_entry_is_padded() {
    let ws = Workspace::new();
    let images = ws
        .build("[binman._testing]\n[binman.\"_testing@1\"]\nalign = 16\n")
        .unwrap();
    let entry = images[0].find_entry("_testing@1").unwrap();
    assert_eq!(entry.offset, Some(16));
    let mut expected = b"aa".to_vec();
    expected.resize(16, 0);
    expected.extend_from_slice(b"aa");
    assert_eq!(ws.output("image.bin"), expected);
}

#[test]
fn fdtmap_describes_the_image() {
    let ws = Workspace::new();
    ws.build("[binman.u-boot]\n[binman.fdtmap]\n").unwrap();
    let data = ws.output("image.bin");
    assert_eq!(&data[..4], U_BOOT_DATA);
    assert_eq!(locate_fdtmap(&data), Some(4));

    let image = Image::from_data(&data).unwrap();
    let u_boot = image.find_entry("u-boot").unwrap();
    assert_eq!((u_boot.offset, u_boot.size, u_boot.image_pos), (Some(0), Some(4), Some(0)));
    assert_eq!(u_boot.data, U_BOOT_DATA);
    assert_eq!(image.find_entry("fdtmap").unwrap().offset, Some(4));
}

#[test]
fn symbols_are_patched_into_stages() {
    let ws = Workspace::new();
    ws.input("spl/u-boot-spl.bin", &[0u8; 16]);
    ws.input(
        "spl/u-boot-spl",
        &make_elf(
            &[0u8; 16],
            &[],
            0x1000,
            &[
                sym("__image_copy_start", 0x1000, 0, false),
                sym("_binman_u_boot_prop_offset", 0x1000, 4, false),
                sym("_binman_u_boot_prop_image_pos", 0x1004, 4, false),
                sym("_binman_missing_prop_size", 0x1008, 8, true),
            ],
        ),
    );
    ws.build("[binman.u-boot-spl]\n[binman.u-boot]\n").unwrap();
    let data = ws.output("image.bin");
    let mut expected = vec![16, 0, 0, 0, 0x10, 0x10, 0, 0];
    expected.extend_from_slice(&[0xff; 8]);
    expected.extend_from_slice(U_BOOT_DATA);
    assert_eq!(data, expected);
}

#[test]
fn unresolvable_strong_symbol_fails() {
    let ws = Workspace::new();
    ws.input("spl/u-boot-spl.bin", &[0u8; 8]);
    ws.input(
        "spl/u-boot-spl",
        &make_elf(
            &[0u8; 8],
            &[],
            0x1000,
            &[
                sym("__image_copy_start", 0x1000, 0, false),
                sym("_binman_missing_prop_offset", 0x1000, 4, false),
            ],
        ),
    );
    let err = ws.build("[binman.u-boot-spl]\n[binman.u-boot]\n").unwrap_err();
    assert_eq!(
        err.to_string(),
        "/binman/u-boot-spl: Entry 'missing' not found in list (u-boot-spl, u-boot)"
    );
}

#[test]
fn maps_and_headers_reach_a_fixed_point() {
    let ws = Workspace::new();
    let description = r#"
        [binman]
        size = 0x400
        [binman.u-boot]
        [binman.fmap]
        [binman.fdtmap]
        [binman.image-header]
        location = "end"
    "#;
    let mut images = ws.build(description).unwrap();
    let data = ws.output("image.bin");
    assert_eq!(data.len(), 0x400);

    let (header, areas) = decode_fmap(&data[4..]).unwrap();
    assert_eq!(header.image_size, 0x400);
    let names: Vec<&str> = areas.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["U_BOOT", "FMAP", "FDTMAP", "IMAGE_HEADER"]);
    assert_eq!((areas[0].offset, areas[0].size), (0, 4));
    assert_eq!((areas[1].offset, areas[1].size), (4, 0xe0));
    assert_eq!(areas[2].offset, 0xe4);
    assert_eq!(areas[3].offset, 0x3f8);

    assert_eq!(locate_fdtmap(&data), Some(0xe4));
    assert_eq!(&data[0x3f8..0x3fc], b"BinM");
    assert_eq!(le32(&data, 0x3fc), 0xe4);

    // Another round over the settled image changes nothing.
    let image = &mut images[0];
    image.process_contents(&ws.context()).unwrap();
    assert_eq!(image.data(), data);
}

#[test]
fn header_at_end_needs_an_image_size() {
    let ws = Workspace::new();
    let err = ws
        .build("[binman.fdtmap]\n[binman.image-header]\nlocation = \"end\"\n")
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Image size must be known to place the image header at the end"));
}

#[test]
fn header_without_fdtmap() {
    let ws = Workspace::new();
    let err = ws.build("[binman.image-header]\nlocation = \"start\"\n").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Node '/binman/image-header': 'image-header' entry must have a 'fdtmap' sibling"
    );

    let err = ws
        .build("[binman.image-header]\nlocation = \"start\"\n[binman.section]\n[binman.section.fdtmap]\n")
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Node '/binman/image-header': 'image-header' entry must have a 'fdtmap' sibling"
    );
}

#[test]
fn cbfs_holds_raw_and_compressed_files() {
    let ws = Workspace::new();
    let text = "compress me compress me compress me compress me";
    let description = format!(
        r#"
        [binman.cbfs]
        size = 0x200
        [binman.cbfs.u-boot]
        [binman.cbfs.text]
        text = "{text}"
        cbfs-compress = "lzma"
        "#
    );
    let images = ws.build(&description).unwrap();
    let data = ws.output("image.bin");
    assert_eq!(data.len(), 0x200);

    let cbfs = CbfsReader::read("/binman/cbfs", &data).unwrap();
    let names: Vec<&str> = cbfs.files.keys().map(String::as_str).collect();
    assert_eq!(&names[..2], ["u-boot", "text"]);
    assert_eq!(cbfs.files["u-boot"].data, U_BOOT_DATA);
    assert_eq!(cbfs.files["text"].data, text.as_bytes());
    assert_eq!(cbfs.files["text"].compress, Compression::Lzma);

    // Each file's entry points at its stored data.
    let u_boot = images[0].find_entry("cbfs/u-boot").unwrap();
    let pos = u_boot.image_pos.unwrap() as usize;
    assert_eq!(&data[pos..pos + 4], U_BOOT_DATA);
    assert_eq!(images[0].find_entry("cbfs/text").unwrap().uncomp_size, Some(text.len() as u64));
}

#[test]
fn cbfs_file_that_does_not_fit() {
    let ws = Workspace::new();
    ws.input("big.bin", &[0x55; 0x100]);
    let err = ws
        .build("[binman.cbfs]\nsize = 0x100\n[binman.cbfs.blob]\nfilename = \"big.bin\"\n")
        .unwrap_err();
    assert!(err.to_string().contains("No space for file 'blob' in CBFS"));
}

#[test]
fn compressed_entry_records_its_size() {
    let ws = Workspace::new();
    let images = ws.build("[binman.u-boot]\ncompress = \"lzma\"\n").unwrap();
    let entry = images[0].find_entry("u-boot").unwrap();
    assert_eq!(entry.uncomp_size, Some(4));
    assert_eq!(entry.read_data(true).unwrap(), U_BOOT_DATA);
    let data = ws.output("image.bin");
    assert_eq!(le32(&data, 0) as usize, data.len() - 4);
}

#[test]
fn end_at_4gb_addresses() {
    let ws = Workspace::new();
    let description = r#"
        [binman]
        size = 0x100
        end-at-4gb = true
        [binman.u-boot]
        offset = 0xfffffff0
    "#;
    let images = ws.build(description).unwrap();
    let data = ws.output("image.bin");
    assert_eq!(data.len(), 0x100);
    assert_eq!(&data[0xf0..0xf4], U_BOOT_DATA);
    assert_eq!(images[0].find_entry("u-boot").unwrap().image_pos, Some(0xf0));
    let map = String::from_utf8(ws.output("image.map")).unwrap();
    assert!(map.contains("000000f0    fffffff0  00000004  u-boot\n"));
}

#[test]
fn failed_build_still_writes_a_map() {
    let ws = Workspace::new();
    let err = ws
        .build("[binman.u-boot]\n[binman._testing]\nreturn-unknown-contents = true\n")
        .unwrap_err();
    assert!(err.to_string().contains("Could not complete processing of contents"));
    let map = String::from_utf8(ws.output("image.map")).unwrap();
    let lines: Vec<&str> = map.lines().collect();
    assert_eq!(lines[0], "ImagePos    Offset      Size  Name");
    assert!(lines[3].contains("<none>"));
    assert!(lines[3].ends_with("_testing"));
    assert!(!ws.out_dir().join("image.bin").exists());
}

#[test]
fn missing_input_file() {
    let ws = Workspace::new();
    let err = ws.build("[binman.blob]\nfilename = \"missing.bin\"\n").unwrap_err();
    assert_eq!(err.to_string(), "Node '/binman/blob': Cannot find input file 'missing.bin'");
}

#[test]
fn builds_are_deterministic() {
    let description = r#"
        [binman]
        [binman.u-boot]
        [binman.section]
        [binman.section.text]
        text = "hello"
        [binman.section.text.hash]
        algo = "sha256"
        [binman.fmap]
        [binman.fdtmap]
    "#;
    let first = Workspace::new();
    first.build(description).unwrap();
    let second = Workspace::new();
    second.build(description).unwrap();
    assert_eq!(first.output("image.bin"), second.output("image.bin"));
    assert_eq!(first.output("image.map"), second.output("image.map"));
}

#[test]
fn multiple_images_are_built_separately() {
    let ws = Workspace::new();
    let description = r#"
        [binman]
        multiple-images = true
        [binman.image1.u-boot]
        [binman.image2]
        filename = "second.bin"
        [binman.image2.text]
        text = "hi"
    "#;
    let images = ws.build(description).unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(ws.output("image1.bin"), U_BOOT_DATA);
    assert_eq!(ws.output("second.bin"), b"hi");
    assert!(ws.out_dir().join("image2.map").exists());

    let only = Workspace::new();
    let root = Node::parse(description).unwrap();
    let images = control::build_images(&root, &mut only.context(), &["image2".to_string()], &only.out_dir(), false)
        .unwrap();
    assert_eq!(images.len(), 1);
    assert!(!only.out_dir().join("image1.bin").exists());
}

#[test]
fn device_tree_gets_entry_positions() {
    let ws = Workspace::new();
    ws.input("u-boot.dtb", &DeviceTree::new().to_bytes());
    let mut ctx = ws.context();
    ctx.update_fdt = true;
    ws.build_with("[binman.u-boot]\n[binman.u-boot-dtb]\n", &mut ctx).unwrap();

    let check = |tree: &DeviceTree| {
        let u_boot = tree.node("/binman/u-boot").expect("u-boot node");
        assert_eq!(u_boot.get_u32("offset"), Some(0));
        assert_eq!(u_boot.get_u32("size"), Some(4));
        let dtb = tree.node("/binman/u-boot-dtb").expect("u-boot-dtb node");
        assert_eq!(dtb.get_u32("offset"), Some(4));
        assert_eq!(dtb.get_u32("image-pos"), Some(4));
    };
    let written = ws.output("u-boot-dtb.out.dtb");
    check(&DeviceTree::from_bytes(&written).unwrap());
    let data = ws.output("image.bin");
    check(&DeviceTree::from_bytes(&data[4..]).unwrap());
    assert_eq!(&data[4..], written.as_slice());
}
