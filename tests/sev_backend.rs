// SPDX-License-Identifier: Apache-2.0

#![cfg(feature = "sev")]

use cgs::backend::sev::{MigrationFirmware, Packet, SendStart, SevMigration};
use cgs::migration::driver::{load_guest_memory, save_guest_memory};
use cgs::migration::PAGE_SIZE;
use cgs::{ConfidentialGuestSupport, Error, MemoryEncryptionOps, SetupParameters, Technology};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PAGES: usize = 4;

/// Firmware double: "transport encryption" XORs with a key carried in the
/// session blob.
#[derive(Default)]
struct XorFirmware {
    key: u8,
    starts: Arc<AtomicUsize>,
    cancels: Arc<AtomicUsize>,
}

impl MigrationFirmware for XorFirmware {
    fn send_start(&mut self, pdh: &[u8], _: &[u8], _: &[u8]) -> Result<SendStart, Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.key = 0x3C;
        Ok(SendStart {
            policy: 0x1,
            pdh: pdh.to_vec(),
            session: vec![self.key],
        })
    }

    fn send_update_data(&mut self, page: &[u8]) -> Result<Packet, Error> {
        Ok(Packet {
            hdr: vec![0xAA; 16],
            trans: page.iter().map(|b| b ^ self.key).collect(),
        })
    }

    fn receive_start(&mut self, start: &SendStart) -> Result<(), Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.key = *start.session.first().ok_or(Error::Firmware(2))?;
        Ok(())
    }

    fn receive_update_data(&mut self, packet: &Packet, page: &mut [u8]) -> Result<(), Error> {
        if packet.hdr.len() != 16 {
            return Err(Error::Firmware(3));
        }

        for (dst, src) in page.iter_mut().zip(&packet.trans) {
            *dst = src ^ self.key;
        }
        Ok(())
    }

    fn cancel(&mut self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

fn params() -> SetupParameters {
    SetupParameters::new("cGRo", "cGxhdA==", "YW1k")
}

fn memory() -> Vec<u8> {
    (0..PAGES * PAGE_SIZE).map(|i| (i % 251) as u8).collect()
}

fn guest(ops: SevMigration<XorFirmware>) -> ConfidentialGuestSupport {
    let mut cgs = ConfidentialGuestSupport::new(Technology::Sev)
        .with_memory_encryption_ops(Box::new(ops))
        .unwrap();
    cgs.mark_ready();
    cgs
}

#[test]
fn sev_round_trip() {
    let source_fw = XorFirmware::default();
    let source_starts = source_fw.starts.clone();
    let source_ops = SevMigration::new(source_fw);
    source_ops.map_gpa_range(2 * PAGE_SIZE as u64, 1, false);
    let mut source = guest(source_ops);

    let mut stream = Vec::<u8>::new();
    let sent = save_guest_memory(&mut source, &params(), &memory(), &mut stream).unwrap();
    assert_eq!(sent.encrypted_pages, (PAGES - 1) as u64);
    assert_eq!(sent.shared_pages, 1);
    assert_eq!(source_starts.load(Ordering::SeqCst), 1);

    let destination_fw = XorFirmware::default();
    let destination_starts = destination_fw.starts.clone();
    let destination_ops = SevMigration::new(destination_fw);
    let regions = destination_ops.shared_regions();
    let mut destination = guest(destination_ops);

    let mut installed = vec![0u8; PAGES * PAGE_SIZE];
    load_guest_memory(&mut destination, &mut installed, &mut &stream[..]).unwrap();

    assert_eq!(installed, memory());
    assert_eq!(destination_starts.load(Ordering::SeqCst), 1);
    assert!(regions.is_shared(cgs::Gfn(2)));
}

#[test]
fn all_shared_guest_never_starts_firmware() {
    let fw = XorFirmware::default();
    let starts = fw.starts.clone();
    let ops = SevMigration::new(fw);
    ops.map_gpa_range(0, PAGES as u64, false);
    let mut source = guest(ops);

    let mut stream = Vec::<u8>::new();
    let sent = save_guest_memory(&mut source, &params(), &memory(), &mut stream).unwrap();
    assert_eq!(sent.encrypted_pages, 0);
    assert_eq!(starts.load(Ordering::SeqCst), 0);
}

#[test]
fn truncated_packet_cancels_firmware() {
    let mut source = guest(SevMigration::new(XorFirmware::default()));
    let mut stream = Vec::<u8>::new();
    save_guest_memory(&mut source, &params(), &memory(), &mut stream).unwrap();
    stream.truncate(stream.len() - PAGE_SIZE);

    let fw = XorFirmware::default();
    let cancels = fw.cancels.clone();
    let mut destination = guest(SevMigration::new(fw));

    let mut installed = vec![0u8; PAGES * PAGE_SIZE];
    assert!(load_guest_memory(&mut destination, &mut installed, &mut &stream[..]).is_err());
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
}

#[test]
fn list_before_setup_is_rejected() {
    let mut ops = SevMigration::new(XorFirmware::default());
    let mut stream = Vec::<u8>::new();
    assert!(matches!(
        ops.save_outgoing_shared_regions_list(&mut stream),
        Err(Error::InvalidState { .. })
    ));
}
