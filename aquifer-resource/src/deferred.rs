use std::sync::Mutex;

type DeferredCall<S> = Box<dyn FnOnce(&S) + Send + 'static>;

struct RingState<S> {
    current: usize,
    buckets: Vec<Vec<DeferredCall<S>>>,
}

// Rebuilds the bucket arena at a larger size. Buckets are copied in logical
// order (nearest retirement first) and the cursor re-positioned so every
// pending call keeps its remaining scheduled distance.
fn grow<S>(
    ring: &mut RingState<S>,
    new_len: usize,
) {
    let old_len = ring.buckets.len();

    let mut rotated = Vec::with_capacity(new_len);
    for offset in 1..=old_len {
        let index = (ring.current + offset) % old_len;
        rotated.push(std::mem::take(&mut ring.buckets[index]));
    }
    rotated.resize_with(new_len, Vec::new);

    ring.buckets = rotated;
    ring.current = new_len - 1;
}

/// An N-bucket ring of pending release calls over a session context `S`,
/// advanced once per rendering frame.
///
/// A call added with delay `d` runs on the `d`-th subsequent [`run_next`],
/// which is how release of GPU-visible objects is held back until every
/// frame that might still reference them has retired. Within a bucket calls
/// run in insertion order; across buckets only bucket order holds.
///
/// One mutex guards cursor movement and insertion; the calls themselves
/// execute unlocked. Calls must not re-enter [`add_call`] on the same ring
/// synchronously: during [`drain_all`] such additions are never picked up.
/// That is a caller responsibility, not a guarantee of this type.
///
/// [`run_next`]: DeferredCallRing::run_next
/// [`add_call`]: DeferredCallRing::add_call
/// [`drain_all`]: DeferredCallRing::drain_all
pub struct DeferredCallRing<S> {
    session: S,
    default_delay: u32,
    ring: Mutex<RingState<S>>,
}

impl<S> DeferredCallRing<S> {
    /// `default_delay` is the delay horizon, typically one more than the
    /// maximum number of frames in flight. A zero horizon is coerced to 1.
    pub fn new(
        session: S,
        default_delay: u32,
    ) -> Self {
        let default_delay = default_delay.max(1);

        DeferredCallRing {
            session,
            default_delay,
            ring: Mutex::new(RingState {
                current: 0,
                buckets: (0..default_delay).map(|_| Vec::new()).collect(),
            }),
        }
    }

    /// The session context handed to every executed call.
    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn default_delay(&self) -> u32 {
        self.default_delay
    }

    /// Schedules `call` at the configured default delay.
    pub fn add_default_call(
        &self,
        call: impl FnOnce(&S) + Send + 'static,
    ) {
        self.add_call(call, self.default_delay);
    }

    /// Schedules `call` to run on the `delay`-th subsequent [`run_next`].
    ///
    /// Delay 0 means "next retirement, not immediately" and is coerced to 1.
    /// A delay beyond the current horizon grows the ring first.
    ///
    /// [`run_next`]: DeferredCallRing::run_next
    pub fn add_call(
        &self,
        call: impl FnOnce(&S) + Send + 'static,
        delay: u32,
    ) {
        let delay = delay.max(1) as usize;

        let mut ring = self.ring.lock().unwrap();

        if delay > ring.buckets.len() {
            log::trace!(
                "deferred ring growing from {} to {} buckets",
                ring.buckets.len(),
                delay
            );
            grow(&mut ring, delay);
        }

        let len = ring.buckets.len();
        let index = (ring.current + delay) % len;
        ring.buckets[index].push(Box::new(call));
    }

    /// Advances the ring by one frame and executes every call whose delay has
    /// elapsed, in insertion order, outside the lock.
    pub fn run_next(&self) {
        let calls = {
            let mut ring = self.ring.lock().unwrap();
            let len = ring.buckets.len();
            ring.current = (ring.current + 1) % len;
            let current = ring.current;
            std::mem::take(&mut ring.buckets[current])
        };

        for call in calls {
            call(&self.session);
        }
    }

    /// Executes every remaining call at once, in ring order starting from the
    /// bucket after the current one, so data scheduled for the nearest
    /// retirement is released first. The teardown path.
    pub fn drain_all(&self) {
        let taken = {
            let mut ring = self.ring.lock().unwrap();
            let len = ring.buckets.len();
            let mut taken = Vec::with_capacity(len);
            for offset in 1..=len {
                let index = (ring.current + offset) % len;
                taken.push(std::mem::take(&mut ring.buckets[index]));
            }
            taken
        };

        for bucket in taken {
            for call in bucket {
                call(&self.session);
            }
        }
    }
}

impl<S> Drop for DeferredCallRing<S> {
    fn drop(&mut self) {
        self.drain_all();
    }
}
