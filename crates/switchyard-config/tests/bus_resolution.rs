//! Resolution of bus addresses from the environment and runtime directory.

use std::cell::RefCell;
use std::collections::BTreeMap;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use switchyard_config::{BusAddress, BusEndpoint, BusType, SESSION_BUS_ENV};

#[derive(Default)]
struct Harness {
    environment: RefCell<BTreeMap<String, String>>,
    runtime_socket: RefCell<Option<BusEndpoint>>,
    resolved: RefCell<Option<BusAddress>>,
    error: RefCell<Option<String>>,
}

impl Harness {
    fn resolve(&self, bus: BusType) {
        let environment = self.environment.borrow().clone();
        let fallback = self.runtime_socket.borrow().clone();
        match bus.resolve_with(|key| environment.get(key).cloned(), || fallback) {
            Ok(address) => *self.resolved.borrow_mut() = Some(address),
            Err(error) => *self.error.borrow_mut() = Some(error.to_string()),
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::default()
}

#[given("the environment names the session bus \"{address}\"")]
fn given_session_environment(harness: &Harness, address: String) {
    harness
        .environment
        .borrow_mut()
        .insert(SESSION_BUS_ENV.to_owned(), address);
}

#[given("the runtime directory holds a bus socket at \"{path}\"")]
fn given_runtime_socket(harness: &Harness, path: String) {
    *harness.runtime_socket.borrow_mut() = Some(BusEndpoint::unix(path));
}

#[when("the session bus is resolved")]
fn when_session_resolved(harness: &Harness) {
    harness.resolve(BusType::Session);
}

#[then("the resolved address is \"{address}\"")]
fn then_resolved_address(harness: &Harness, address: String) {
    if let Some(error) = harness.error.borrow().as_ref() {
        panic!("bus failed to resolve: {error}");
    }
    let resolved = harness.resolved.borrow();
    let Some(resolved) = resolved.as_ref() else {
        panic!("bus was not resolved");
    };
    assert_eq!(resolved.to_string(), address);
}

#[scenario(path = "tests/features/bus_resolution.feature")]
fn session_bus_from_environment(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/bus_fallback.feature")]
fn session_bus_fallback(#[from(harness)] harness: Harness) {
    let _ = harness;
}
