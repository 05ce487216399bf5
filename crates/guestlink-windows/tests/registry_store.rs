#![cfg(windows)]

use std::sync::Arc;
use std::time::Duration;

use guestlink_core::cancel::CancellationToken;
use guestlink_core::codec::MessageCodec;
use guestlink_core::config::RegistryHive;
use guestlink_core::guest::GuestChannel;
use guestlink_core::notifier::{ChangeNotifier, EventNotifier, WaitOutcome};
use guestlink_core::store::KvpStore;
use guestlink_windows::registry::RegistryKvpStore;
use guestlink_windows::watcher::RegistryChangeSource;
use uuid::Uuid;
use winreg::enums::HKEY_CURRENT_USER;
use winreg::RegKey;

#[test]
fn registry_store_reads_writes_and_deletes_string_values() {
    let (key_path, _guard) = create_test_key();
    let store = RegistryKvpStore::open(RegistryHive::HkeyCurrentUser, &key_path).expect("open store");

    store.write("DevSetup{1}~1~1", "payload").expect("write");
    store.write("Other", "x").expect("write");
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let key = hkcu.open_subkey(&key_path).expect("open key");
    key.set_value("DevSetup{2}~1~1", &7u32).expect("set dword");

    let entries = store.read_all("DevSetup{").expect("read");
    assert_eq!(entries.len(), 1, "non-string values are ignored");
    assert_eq!(entries["DevSetup{1}~1~1"], "payload");

    store.delete("DevSetup{1}~1~1").expect("delete");
    store.delete("DevSetup{1}~1~1").expect("deleting a missing value succeeds");
    assert!(store.read_all("DevSetup{").expect("read").is_empty());
}

#[test]
fn change_source_signals_on_value_write() {
    let (key_path, _guard) = create_test_key();
    let store = RegistryKvpStore::open(RegistryHive::HkeyCurrentUser, &key_path).expect("open store");
    let source = RegistryChangeSource::open(RegistryHive::HkeyCurrentUser, &key_path).expect("open source");
    let notifier = EventNotifier::new(source);
    let cancel = CancellationToken::new();

    notifier.start().expect("start");
    std::thread::sleep(Duration::from_millis(100));
    store.write("DevSetup{1}~1~1", "x").expect("write");
    assert_eq!(notifier.wait(&cancel, Duration::from_secs(5)), WaitOutcome::Changed);
    notifier.stop();
}

#[test]
fn guest_channel_over_registry_keys() {
    let (inbound_path, _g1) = create_test_key();
    let (outbound_path, _g2) = create_test_key();
    let inbound = Arc::new(RegistryKvpStore::open(RegistryHive::HkeyCurrentUser, &inbound_path).expect("inbound"));
    let outbound = Arc::new(RegistryKvpStore::open(RegistryHive::HkeyCurrentUser, &outbound_path).expect("outbound"));
    let source = RegistryChangeSource::open(RegistryHive::HkeyCurrentUser, &inbound_path).expect("source");
    let codec = MessageCodec::new("DevSetup", '~', 5);
    let guest = GuestChannel::new(inbound.clone(), outbound, EventNotifier::new(source), codec.clone());

    for (name, value) in codec.encode("DevSetup{3}", "hello registry") {
        inbound.write(&name, &value).expect("write chunk");
    }
    let cancel = CancellationToken::new();
    let message = guest
        .wait_for_message(&cancel, Duration::from_secs(5))
        .expect("message delivered");
    assert_eq!(message.request_data, "hello registry");
    assert!(inbound.read_all("DevSetup{").expect("read").is_empty());
}

fn create_test_key() -> (String, CleanupKey) {
    let path = format!("Software\\GuestLinkTest\\{}", Uuid::new_v4());
    (path.clone(), CleanupKey(path))
}

struct CleanupKey(String);

impl Drop for CleanupKey {
    fn drop(&mut self) {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let _ = hkcu.delete_subkey_all(&self.0);
    }
}
