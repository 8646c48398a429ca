use actix::prelude::*;
use chrono::{DateTime, Local};
use cotas_pdu::{ObjectId, MAX_OBJECT_ID, MIN_OBJECT_ID};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::HashMap, net::SocketAddr};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No free object id found after {0} attempts")]
    IdSpaceExhausted(u32),
    #[error("Object id {0} is already registered")]
    DuplicateId(ObjectId),
    #[error("Object id {0} is outside the issued range")]
    IdOutOfRange(ObjectId),
}

/// One subscribed smart object or application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRegistration {
    pub id: ObjectId,
    /// Address the subscribe request came from
    pub source: SocketAddr,
    /// Address consumers use to reach the object directly
    pub endpoint: SocketAddr,
    pub category: Option<String>,
    pub registered_at: DateTime<Local>,
}

/// Outcome of a subscribe
#[derive(Debug)]
pub enum Enrollment {
    /// The source already owned a confirmed registration, nothing changed
    Existing(ObjectRegistration),
    /// A new id was reserved. The caller must [`Confirm`] it once the initial
    /// state is stored, or [`Release`] it if that fails
    Fresh(ObjectRegistration),
    /// The source's id is reserved but not yet confirmed. The receiver
    /// resolves to `true` on confirm and `false` on release
    Pending(ObjectRegistration, oneshot::Receiver<bool>),
}

impl Enrollment {
    pub fn registration(&self) -> &ObjectRegistration {
        match self {
            Enrollment::Existing(r) | Enrollment::Fresh(r) | Enrollment::Pending(r, _) => r,
        }
    }
}

/// Identity state of the broker. The only writer of object ids, so a
/// lookup here answers ownership without a store round trip
pub struct Registry {
    objects: HashMap<ObjectId, ObjectRegistration>,
    by_source: HashMap<SocketAddr, ObjectId>,
    /// Reserved ids whose initial state is not stored yet, with the
    /// subscribers waiting on the outcome
    pending: HashMap<ObjectId, Vec<oneshot::Sender<bool>>>,
    rng: StdRng,
    max_id_attempts: u32,
}

impl Registry {
    pub fn new(max_id_attempts: u32) -> Self {
        Self::with_rng(StdRng::from_entropy(), max_id_attempts)
    }

    /// Deterministic id sequence, for reproducible runs
    pub fn seeded(seed: u64, max_id_attempts: u32) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), max_id_attempts)
    }

    fn with_rng(rng: StdRng, max_id_attempts: u32) -> Self {
        Self {
            objects: HashMap::new(),
            by_source: HashMap::new(),
            pending: HashMap::new(),
            rng,
            max_id_attempts: max_id_attempts.max(1),
        }
    }

    fn sample_id(&mut self) -> Result<ObjectId, RegistryError> {
        for _ in 0..self.max_id_attempts {
            let candidate = self.rng.gen_range(MIN_OBJECT_ID..MAX_OBJECT_ID);
            if !self.objects.contains_key(&candidate) {
                return Ok(candidate);
            }
            log::debug!("Object id {candidate:} taken, resampling");
        }
        log::error!(
            "Unable to find a free object id in {} attempts",
            self.max_id_attempts
        );
        Err(RegistryError::IdSpaceExhausted(self.max_id_attempts))
    }

    pub fn enroll(
        &mut self,
        source: SocketAddr,
        endpoint: SocketAddr,
        category: Option<String>,
    ) -> Result<Enrollment, RegistryError> {
        if let Some(existing) = self
            .by_source
            .get(&source)
            .and_then(|id| self.objects.get(id))
        {
            if let Some(waiters) = self.pending.get_mut(&existing.id) {
                log::debug!("{source:} registration {} still pending", existing.id);
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                return Ok(Enrollment::Pending(existing.clone(), rx));
            }
            log::debug!("{source:} already registered as {}", existing.id);
            return Ok(Enrollment::Existing(existing.clone()));
        }

        let id = self.sample_id()?;
        let registration = ObjectRegistration {
            id,
            source,
            endpoint,
            category,
            registered_at: Local::now(),
        };
        self.insert(registration.clone());
        self.pending.insert(id, Vec::new());
        log::info!("Reserved object id {id:} for {source:}");
        Ok(Enrollment::Fresh(registration))
    }

    /// Mark a fresh registration as stored and wake its waiters
    pub fn confirm(&mut self, id: ObjectId) {
        match self.pending.remove(&id) {
            Some(waiters) => {
                for waiter in waiters {
                    waiter.send(true).ok();
                }
                log::info!("Registered object {id:}");
            }
            None => log::warn!("Confirming object id {id:} that is not pending"),
        }
    }

    /// Register an object whose id was issued elsewhere (seed graph)
    pub fn adopt(&mut self, registration: ObjectRegistration) -> Result<(), RegistryError> {
        if !(MIN_OBJECT_ID..MAX_OBJECT_ID).contains(&registration.id) {
            return Err(RegistryError::IdOutOfRange(registration.id));
        }
        if self.objects.contains_key(&registration.id) {
            return Err(RegistryError::DuplicateId(registration.id));
        }
        self.insert(registration);
        Ok(())
    }

    pub fn release(&mut self, id: ObjectId) {
        for waiter in self.pending.remove(&id).into_iter().flatten() {
            waiter.send(false).ok();
        }
        match self.objects.remove(&id) {
            Some(registration) => {
                if self.by_source.get(&registration.source) == Some(&id) {
                    self.by_source.remove(&registration.source);
                }
                log::debug!("Released object id {id:}");
            }
            None => log::warn!("Releasing unknown object id {id:}"),
        }
    }

    /// True once the id's registration is confirmed. Pending ids are not
    /// owned yet, their object may not exist in the store
    pub fn owns(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id) && !self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn insert(&mut self, registration: ObjectRegistration) {
        self.by_source.insert(registration.source, registration.id);
        self.objects.insert(registration.id, registration);
    }
}

impl Actor for Registry {
    type Context = Context<Self>;
}

/// Subscribe `source`: returns its existing registration or reserves a new id
#[derive(Message)]
#[rtype(result = "EnrollResponse")]
pub struct Enroll {
    pub source: SocketAddr,
    pub endpoint: SocketAddr,
    pub category: Option<String>,
}
type EnrollResponse = Result<Enrollment, RegistryError>;

impl Handler<Enroll> for Registry {
    type Result = EnrollResponse;

    fn handle(&mut self, msg: Enroll, _ctx: &mut Self::Context) -> Self::Result {
        self.enroll(msg.source, msg.endpoint, msg.category)
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Confirm(pub ObjectId);

impl Handler<Confirm> for Registry {
    type Result = ();

    fn handle(&mut self, msg: Confirm, _ctx: &mut Self::Context) -> Self::Result {
        self.confirm(msg.0)
    }
}

/// Give back an id whose registration could not be completed
#[derive(Message)]
#[rtype(result = "()")]
pub struct Release(pub ObjectId);

impl Handler<Release> for Registry {
    type Result = ();

    fn handle(&mut self, msg: Release, _ctx: &mut Self::Context) -> Self::Result {
        self.release(msg.0)
    }
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct CheckOwnership(pub ObjectId);

impl Handler<CheckOwnership> for Registry {
    type Result = bool;

    fn handle(&mut self, msg: CheckOwnership, _ctx: &mut Self::Context) -> Self::Result {
        self.owns(msg.0)
    }
}

#[derive(Message)]
#[rtype(result = "AdoptResponse")]
pub struct Adopt(pub ObjectRegistration);
type AdoptResponse = Result<(), RegistryError>;

impl Handler<Adopt> for Registry {
    type Result = AdoptResponse;

    fn handle(&mut self, msg: Adopt, _ctx: &mut Self::Context) -> Self::Result {
        self.adopt(msg.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn subscribe_is_idempotent_per_source() {
        let mut registry = Registry::seeded(1, 16);
        let source = addr("10.0.0.2:5000");

        let first = registry.enroll(source, source, Some("Lamp".into())).unwrap();
        let id = first.registration().id;
        registry.confirm(id);
        let second = registry.enroll(source, source, None).unwrap();

        assert!(matches!(first, Enrollment::Fresh(_)));
        assert!(matches!(second, Enrollment::Existing(_)));
        assert_eq!(second.registration().id, id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resubscribe_while_pending_waits_for_outcome() {
        let mut registry = Registry::seeded(1, 16);
        let source = addr("10.0.0.2:5000");

        let id = registry.enroll(source, source, None).unwrap().registration().id;
        assert!(!registry.owns(id));

        let Ok(Enrollment::Pending(registration, mut confirmed)) =
            registry.enroll(source, source, None)
        else {
            panic!("second subscribe should wait on the first");
        };
        assert_eq!(registration.id, id);
        assert!(confirmed.try_recv().is_err());

        registry.confirm(id);
        assert_eq!(confirmed.try_recv(), Ok(true));
        assert!(registry.owns(id));
    }

    #[test]
    fn release_while_pending_fails_waiters() {
        let mut registry = Registry::seeded(2, 16);
        let source = addr("10.0.0.2:5001");

        let id = registry.enroll(source, source, None).unwrap().registration().id;
        let Ok(Enrollment::Pending(_, mut outcome)) = registry.enroll(source, source, None) else {
            panic!("second subscribe should wait on the first");
        };

        registry.release(id);
        assert_eq!(outcome.try_recv(), Ok(false));
        assert!(!registry.owns(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_unique_and_in_range() {
        let mut registry = Registry::seeded(7, 64);
        let mut seen = std::collections::HashSet::new();
        for port in 1000..1500 {
            let source = addr(&format!("10.0.0.1:{port}"));
            let id = registry
                .enroll(source, source, None)
                .unwrap()
                .registration()
                .id;
            assert!((MIN_OBJECT_ID..MAX_OBJECT_ID).contains(&id));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn exhausted_sampling_is_reported() {
        let mut registry = Registry::seeded(3, 4);
        // Occupy every id the seeded rng is going to propose
        let mut upcoming = StdRng::seed_from_u64(3);
        for _ in 0..4 {
            let id = upcoming.gen_range(MIN_OBJECT_ID..MAX_OBJECT_ID);
            registry
                .adopt(ObjectRegistration {
                    id,
                    source: addr(&format!("10.9.9.9:{}", id % 60000)),
                    endpoint: addr("10.9.9.9:1"),
                    category: None,
                    registered_at: Local::now(),
                })
                .ok();
        }
        let source = addr("10.0.0.3:1");
        assert!(matches!(
            registry.enroll(source, source, None),
            Err(RegistryError::IdSpaceExhausted(4))
        ));
    }

    #[test]
    fn release_frees_source() {
        let mut registry = Registry::seeded(5, 16);
        let source = addr("10.0.0.4:9");
        let id = registry.enroll(source, source, None).unwrap().registration().id;
        registry.release(id);
        assert!(!registry.owns(id));
        assert!(matches!(
            registry.enroll(source, source, None),
            Ok(Enrollment::Fresh(_))
        ));
    }

    #[test]
    fn adopt_rejects_duplicates_and_out_of_range() {
        let mut registry = Registry::seeded(5, 16);
        let seed = ObjectRegistration {
            id: 30_000,
            source: addr("10.0.0.5:19"),
            endpoint: addr("10.0.0.5:19"),
            category: Some("Camera".into()),
            registered_at: Local::now(),
        };
        registry.adopt(seed.clone()).unwrap();
        assert_eq!(
            registry.adopt(seed.clone()),
            Err(RegistryError::DuplicateId(30_000))
        );
        assert_eq!(
            registry.adopt(ObjectRegistration { id: 5, ..seed }),
            Err(RegistryError::IdOutOfRange(5))
        );
    }

    #[actix::test]
    async fn actor_answers_ownership() {
        let registry = Registry::seeded(11, 16).start();
        let source = addr("127.0.0.1:4000");

        let enrollment = registry
            .send(Enroll {
                source,
                endpoint: source,
                category: None,
            })
            .await
            .unwrap()
            .unwrap();
        let id = enrollment.registration().id;
        assert_eq!(enrollment.registration().source, source);

        assert!(!registry.send(CheckOwnership(id)).await.unwrap());
        registry.send(Confirm(id)).await.unwrap();
        assert!(registry.send(CheckOwnership(id)).await.unwrap());
        assert!(!registry.send(CheckOwnership(MIN_OBJECT_ID - 1)).await.unwrap());

        registry.send(Release(id)).await.unwrap();
        assert!(!registry.send(CheckOwnership(id)).await.unwrap());
    }
}
