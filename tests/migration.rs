// SPDX-License-Identifier: Apache-2.0

use cgs::backend::mock::{FailPoint, MockBackend, Operation};
use cgs::migration::driver::{load_guest_memory, save_guest_memory, MigrationSummary};
use cgs::migration::regions::SharedRegionList;
use cgs::migration::stream::PageHeader;
use cgs::migration::PAGE_SIZE;
use cgs::parser::Encoder;
use cgs::{ConfidentialGuestSupport, Error, Gfn, MemoryEncryptionOps, SetupParameters, Technology};

use std::io::ErrorKind;

const PAGES: usize = 8;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn params() -> SetupParameters {
    SetupParameters::new("pdh", "plat-cert", "amd-cert")
}

fn guest_memory() -> Vec<u8> {
    (0..PAGES * PAGE_SIZE)
        .map(|i| ((i / PAGE_SIZE) as u8) << 4 | (i % 13) as u8)
        .collect()
}

fn sev_guest(mock: MockBackend) -> ConfidentialGuestSupport {
    let mut cgs = ConfidentialGuestSupport::new(Technology::Sev)
        .with_memory_encryption_ops(Box::new(mock))
        .unwrap();
    cgs.mark_ready();
    cgs
}

/// Source with gfn 5 shared and everything else private.
fn encrypted_stream() -> (Vec<u8>, MigrationSummary) {
    let mock = MockBackend::new();
    mock.shared_regions().share(Gfn(5), 1);
    let mut source = sev_guest(mock);

    let mut stream = Vec::<u8>::new();
    let summary = save_guest_memory(&mut source, &params(), &guest_memory(), &mut stream).unwrap();
    (stream, summary)
}

#[test]
fn encrypted_round_trip() {
    init_tracing();

    let (stream, sent) = encrypted_stream();
    assert_eq!(
        sent,
        MigrationSummary {
            encrypted_pages: (PAGES - 1) as u64,
            shared_pages: 1,
            bytes_sent: (PAGES * PAGE_SIZE) as u64,
        }
    );

    let mock = MockBackend::new();
    let regions = mock.shared_regions();
    let mut destination = sev_guest(mock);

    let mut memory = vec![0u8; PAGES * PAGE_SIZE];
    let received = load_guest_memory(&mut destination, &mut memory, &mut &stream[..]).unwrap();

    assert_eq!(memory, guest_memory());
    assert_eq!(received.encrypted_pages, sent.encrypted_pages);
    assert_eq!(received.shared_pages, sent.shared_pages);

    let list = regions.snapshot();
    assert_eq!(list.len(), 1);
    assert_eq!(list.pages(), 1);
    assert!(regions.is_shared(Gfn(5)));
    assert!(!regions.is_shared(Gfn(6)));
}

#[test]
fn private_pages_are_not_sent_in_the_clear() {
    let (stream, _) = encrypted_stream();
    let memory = guest_memory();

    let page = |gfn: usize| &memory[gfn * PAGE_SIZE..(gfn + 1) * PAGE_SIZE];
    let found = |needle: &[u8]| stream.windows(needle.len()).any(|w| w == needle);

    assert!(found(page(5)));
    assert!(!found(page(6)));
}

#[test]
fn setup_failure_sends_nothing() {
    let mock = MockBackend::new().fail_at(FailPoint::SaveSetup);
    let journal = mock.journal();
    let mut source = sev_guest(mock);

    let mut stream = Vec::<u8>::new();
    let err = save_guest_memory(&mut source, &params(), &guest_memory(), &mut stream).unwrap_err();

    assert!(matches!(err, Error::Firmware(_)));
    assert!(stream.is_empty());
    assert_eq!(journal.count(Operation::SaveOutgoingPage), 0);
    assert_eq!(journal.operations().last(), Some(&Operation::Cancel));
}

#[test]
fn page_failure_aborts_migration() {
    let mock = MockBackend::new().fail_at(FailPoint::SaveOutgoingPage(2));
    let journal = mock.journal();
    let mut source = sev_guest(mock);

    let mut stream = Vec::<u8>::new();
    let err = save_guest_memory(&mut source, &params(), &guest_memory(), &mut stream).unwrap_err();

    assert!(matches!(err, Error::Firmware(_)));
    assert_eq!(journal.count(Operation::SaveOutgoingPage), 3);
    assert_eq!(journal.count(Operation::Cancel), 1);
}

#[test]
fn unready_guest_cannot_migrate() {
    let mut source = ConfidentialGuestSupport::new(Technology::Sev)
        .with_memory_encryption_ops(Box::new(MockBackend::new()))
        .unwrap();

    let mut stream = Vec::<u8>::new();
    let err = save_guest_memory(&mut source, &params(), &guest_memory(), &mut stream).unwrap_err();
    assert!(matches!(err, Error::NotReady));
    assert!(stream.is_empty());
}

#[test]
fn truncated_stream_fails_destination() {
    let (mut stream, _) = encrypted_stream();
    stream.truncate(stream.len() / 2);

    let mock = MockBackend::new();
    let journal = mock.journal();
    let mut destination = sev_guest(mock);

    let mut memory = vec![0u8; PAGES * PAGE_SIZE];
    match load_guest_memory(&mut destination, &mut memory, &mut &stream[..]) {
        Err(Error::IoError(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(journal.operations().last(), Some(&Operation::Cancel));
}

#[test]
fn shared_tag_on_private_page_is_rejected() {
    let mut stream = Vec::<u8>::new();
    SharedRegionList::new().encode(&mut stream, ()).unwrap();
    PageHeader::shared(Gfn(1)).encode(&mut stream, ()).unwrap();
    stream.extend_from_slice(&[0u8; PAGE_SIZE]);
    PageHeader::eos().encode(&mut stream, ()).unwrap();

    let mut destination = sev_guest(MockBackend::new());
    let mut memory = vec![0u8; PAGES * PAGE_SIZE];
    let err = load_guest_memory(&mut destination, &mut memory, &mut &stream[..]).unwrap_err();
    assert!(matches!(err, Error::ClassificationMismatch(Gfn(1))));
}

#[test]
fn plain_round_trip() {
    let mut source = ConfidentialGuestSupport::new(Technology::Tdx);
    source.mark_ready();

    let mut stream = Vec::<u8>::new();
    let sent = save_guest_memory(&mut source, &params(), &guest_memory(), &mut stream).unwrap();
    assert_eq!(sent.encrypted_pages, 0);
    assert_eq!(sent.shared_pages, PAGES as u64);

    let mut destination = ConfidentialGuestSupport::new(Technology::Tdx);
    destination.mark_ready();

    let mut memory = vec![0u8; PAGES * PAGE_SIZE];
    load_guest_memory(&mut destination, &mut memory, &mut &stream[..]).unwrap();
    assert_eq!(memory, guest_memory());
}

#[test]
fn plain_guest_rejects_encrypted_records() {
    let mut stream = Vec::<u8>::new();
    PageHeader::encrypted(Gfn(0)).encode(&mut stream, ()).unwrap();
    stream.extend_from_slice(&[0u8; PAGE_SIZE]);

    let mut destination = ConfidentialGuestSupport::new(Technology::Pef);
    destination.mark_ready();

    let mut memory = vec![0u8; PAGES * PAGE_SIZE];
    let err = load_guest_memory(&mut destination, &mut memory, &mut &stream[..]).unwrap_err();
    assert!(matches!(err, Error::InvalidRecord(_)));
}

#[test]
fn non_migratable_technology_refuses_ops() {
    let err = ConfidentialGuestSupport::new(Technology::Tdx)
        .with_memory_encryption_ops(Box::new(MockBackend::new()))
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(Technology::Tdx)));
}

#[test]
fn empty_page_section_is_not_a_migration() {
    let mut stream = Vec::<u8>::new();
    SharedRegionList::new().encode(&mut stream, ()).unwrap();
    PageHeader::eos().encode(&mut stream, ()).unwrap();

    let mock = MockBackend::new();
    let journal = mock.journal();
    let mut destination = sev_guest(mock);

    let mut memory = vec![0u8; PAGES * PAGE_SIZE];
    let err = load_guest_memory(&mut destination, &mut memory, &mut &stream[..]).unwrap_err();
    assert!(matches!(err, Error::InvalidRecord(_)));
    assert_eq!(journal.operations().last(), Some(&Operation::Cancel));
}

#[test]
fn missing_page_fails_destination() {
    let mut source = ConfidentialGuestSupport::new(Technology::Tdx);
    source.mark_ready();

    // A guest one page larger than what the source sent.
    let mut stream = Vec::<u8>::new();
    save_guest_memory(&mut source, &params(), &guest_memory(), &mut stream).unwrap();

    let mut destination = ConfidentialGuestSupport::new(Technology::Tdx);
    destination.mark_ready();

    let mut memory = vec![0u8; (PAGES + 1) * PAGE_SIZE];
    let err = load_guest_memory(&mut destination, &mut memory, &mut &stream[..]).unwrap_err();
    assert!(matches!(err, Error::InvalidRecord(_)));
}

#[test]
fn duplicate_page_fails_destination() {
    let mut stream = Vec::<u8>::new();
    for _ in 0..2 {
        PageHeader::shared(Gfn(0)).encode(&mut stream, ()).unwrap();
        stream.extend_from_slice(&[0x11u8; PAGE_SIZE]);
    }
    PageHeader::eos().encode(&mut stream, ()).unwrap();

    let mut destination = ConfidentialGuestSupport::new(Technology::Pef);
    destination.mark_ready();

    let mut memory = vec![0u8; 2 * PAGE_SIZE];
    let err = load_guest_memory(&mut destination, &mut memory, &mut &stream[..]).unwrap_err();
    assert!(matches!(err, Error::InvalidRecord(_)));
}

#[test]
fn classification_survives_the_stream() {
    const FRAMES: u64 = 32;

    let mut source = MockBackend::new();
    let regions = source.shared_regions();
    regions.share(Gfn(2), 3);
    regions.share(Gfn(5), 1); // adjacent, merges into [2, 6)
    regions.share(Gfn(10), 8);
    regions.unshare(Gfn(12), 2); // splits into [10, 12) and [14, 18)
    regions.share(Gfn(FRAMES - 1), 1);
    regions.share(Gfn(20), 4);
    regions.unshare(Gfn(20), 1);
    assert_eq!(regions.snapshot().len(), 5);

    source.save_setup(&params()).unwrap();
    let mut stream = Vec::<u8>::new();
    source.save_outgoing_shared_regions_list(&mut stream).unwrap();

    let mut destination = MockBackend::new();
    destination
        .load_incoming_shared_regions_list(&mut &stream[..])
        .unwrap();

    for gfn in (0..=FRAMES).map(Gfn) {
        assert_eq!(
            source.is_gfn_in_unshared_region(gfn),
            destination.is_gfn_in_unshared_region(gfn),
            "classification differs at gfn {gfn}"
        );
    }
}
