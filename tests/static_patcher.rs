//! Behavior of the static PE32 patcher against synthetic images.

mod common;

use common::{
    minimal_pe32_plus, minimal_pe32_with_imports, one_kib_payload, pe32_missing_resolver_import,
    pe32_with_no_sections, ENTRY_RVA,
};
use hw_protector::error::ProtectError;
use hw_protector::patcher::{original_entry_of_patched, patch};
use hw_protector::pe::{PeImage, SECTION_MEM_EXECUTE};

#[test]
fn patch_redirects_the_entry_point() {
    let input = minimal_pe32_with_imports();
    let patched = patch(&input).unwrap();

    let before = PeImage::parse(&input).unwrap();
    let after = PeImage::parse(&patched).unwrap();
    assert_ne!(
        after.optional.address_of_entry_point,
        before.optional.address_of_entry_point
    );
}

#[test]
fn injected_section_is_executable_and_counted() {
    let input = minimal_pe32_with_imports();
    let patched = patch(&input).unwrap();
    let after = PeImage::parse(&patched).unwrap();

    assert_eq!(
        after.file.number_of_sections,
        PeImage::parse(&input).unwrap().file.number_of_sections + 1
    );

    let entry = after.optional.address_of_entry_point;
    let section = after
        .sections
        .iter()
        .find(|s| {
            let span = s.virtual_size.max(s.size_of_raw_data);
            entry >= s.virtual_address && entry < s.virtual_address + span
        })
        .expect("entry point must land in a section");
    assert_ne!(section.characteristics & SECTION_MEM_EXECUTE, 0);
}

#[test]
fn original_entry_is_reconstructible_from_the_shim() {
    let input = minimal_pe32_with_imports();
    let patched = patch(&input).unwrap();
    assert_eq!(original_entry_of_patched(&patched).unwrap(), ENTRY_RVA);
}

#[test]
fn size_of_image_covers_the_new_section() {
    let input = minimal_pe32_with_imports();
    let patched = patch(&input).unwrap();
    let after = PeImage::parse(&patched).unwrap();

    let last = after.sections.last().unwrap();
    assert!(after.optional.size_of_image >= last.virtual_address + last.virtual_size);
    // Only the header and the appended tail changed; the original
    // sections' raw data is byte-identical.
    let first_raw = after.sections[0].pointer_to_raw_data as usize;
    assert_eq!(&patched[first_raw..input.len()], &input[first_raw..]);
}

#[test]
fn rejects_pe32_plus_with_a_format_error() {
    let err = patch(&minimal_pe32_plus()).unwrap_err();
    assert!(matches!(err, ProtectError::Format(_)));
}

#[test]
fn rejects_an_image_with_no_sections() {
    let err = patch(&pe32_with_no_sections()).unwrap_err();
    assert!(matches!(err, ProtectError::Format(_)));
}

#[test]
fn rejects_an_image_missing_a_loader_import() {
    let err = patch(&pe32_missing_resolver_import()).unwrap_err();
    assert!(matches!(err, ProtectError::Format(_)));
}

#[test]
fn rejects_a_non_pe_payload() {
    let err = patch(&one_kib_payload()).unwrap_err();
    assert!(matches!(err, ProtectError::Format(_)));
}

#[test]
fn patched_image_still_parses_cleanly() {
    let patched = patch(&minimal_pe32_with_imports()).unwrap();
    let after = PeImage::parse(&patched).unwrap();
    // The shim and its string pool live inside the new section's raw data.
    let entry_offset = after
        .rva_to_offset(after.optional.address_of_entry_point)
        .unwrap();
    assert_eq!(patched[entry_offset], 0x60); // pushad
    let window = &patched[entry_offset..entry_offset + 0x60];
    let has_strings = window
        .windows(10)
        .any(|w| w == b"user32.dll");
    assert!(has_strings, "string pool must follow the shim code");
}
