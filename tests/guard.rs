// SPDX-License-Identifier: Apache-2.0

//! The readiness guard terminates the process, so the aborting cases run
//! the test binary again as a child and inspect how it died.

use cgs::{MachineConfig, MachineState, Technology};

use serial_test::serial;

use std::env;
use std::process::{Command, Output};

const CHILD: &str = "CGS_GUARD_CHILD";

fn in_child(test: &str) -> bool {
    env::var(CHILD).as_deref() == Ok(test)
}

fn run_child(test: &str) -> Output {
    Command::new(env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD, test)
        .output()
        .unwrap()
}

fn assert_aborted(out: &Output) {
    assert!(!out.status.success());

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(out.status.signal(), Some(libc::SIGABRT));
    }

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("never initialized"), "stderr: {stderr}");
}

#[test]
#[serial]
fn unready_guest_aborts() {
    if in_child("unready_guest_aborts") {
        let machine = MachineState::new(MachineConfig::confidential(Technology::Tdx));
        machine.assert_cgs_ready_or_abort();
        return;
    }

    let out = run_child("unready_guest_aborts");
    assert_aborted(&out);
    assert!(String::from_utf8_lossy(&out.stderr).contains("tdx-guest"));
}

#[test]
#[serial]
fn unready_support_object_aborts() {
    if in_child("unready_support_object_aborts") {
        let cgs = cgs::ConfidentialGuestSupport::new(Technology::SevSnp);
        cgs.assert_ready_or_abort();
        return;
    }

    assert_aborted(&run_child("unready_support_object_aborts"));
}

#[test]
#[serial]
fn ready_guest_starts() {
    if in_child("ready_guest_starts") {
        let mut machine = MachineState::new(MachineConfig::confidential(Technology::SevSnp));
        machine.cgs_mut().unwrap().mark_ready();
        machine.assert_cgs_ready_or_abort();
        return;
    }

    let out = run_child("ready_guest_starts");
    assert!(out.status.success(), "{out:?}");
}

#[test]
fn plain_guest_is_not_checked() {
    let machine = MachineState::new(MachineConfig::default());
    assert!(!machine.is_confidential());
    machine.assert_cgs_ready_or_abort();
}

#[test]
fn ready_is_sticky() {
    let mut machine = MachineState::new(MachineConfig::confidential(Technology::Pef));
    let cgs = machine.cgs_mut().unwrap();
    cgs.mark_ready();
    cgs.mark_ready();
    assert!(cgs.is_ready());
    machine.assert_cgs_ready_or_abort();
}
