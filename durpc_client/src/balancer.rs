use rand::Rng;

use durpc_protocol::{Error, ErrorKind, Result};

use super::resolver::{Address, AddressSet, ResolverState};

/// Selects one address per outbound call attempt from the resolver's current
/// snapshot. `pick` never blocks: with no snapshot yet, it fails immediately.
pub trait Balancer: Send {
    /// Applies a freshly pushed resolver snapshot.
    fn update(&mut self, state: &ResolverState);

    fn pick(&mut self) -> Result<Address>;
}

/// Walks the address set with a wrapping cursor. The cursor resets whenever
/// the set is replaced; fairness is not preserved across a topology change.
#[derive(Default)]
pub struct RoundRobinBalancer {
    set: AddressSet,
    cursor: usize,
    last_error: Option<Error>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Balancer for RoundRobinBalancer {
    fn update(&mut self, state: &ResolverState) {
        self.last_error = state.error.clone();
        if let Some(set) = &state.address_set {
            if set.version != self.set.version {
                self.set = set.clone();
                self.cursor = 0;
            }
        }
    }

    fn pick(&mut self) -> Result<Address> {
        if let Some(err) = &self.last_error {
            return Err(err.clone());
        }
        if self.set.addresses.is_empty() {
            return Err(Error::new(
                ErrorKind::NoAddressesAvailable,
                "address set is empty",
            ));
        }
        let address = self.set.addresses[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.set.addresses.len();
        Ok(address)
    }
}

/// Picks uniformly at random from the current set.
#[derive(Default)]
pub struct RandomBalancer {
    set: AddressSet,
    last_error: Option<Error>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Balancer for RandomBalancer {
    fn update(&mut self, state: &ResolverState) {
        self.last_error = state.error.clone();
        if let Some(set) = &state.address_set {
            if set.version != self.set.version {
                self.set = set.clone();
            }
        }
    }

    fn pick(&mut self) -> Result<Address> {
        if let Some(err) = &self.last_error {
            return Err(err.clone());
        }
        if self.set.addresses.is_empty() {
            return Err(Error::new(
                ErrorKind::NoAddressesAvailable,
                "address set is empty",
            ));
        }
        let idx = rand::thread_rng().gen_range(0..self.set.addresses.len());
        Ok(self.set.addresses[idx].clone())
    }
}
