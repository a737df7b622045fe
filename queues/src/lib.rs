//! Lock-Free MPMC FIFO Queues
//!
//! Building blocks for high-concurrency runtimes: worker pools, event
//! loops, message fan-out, inter-thread hand-off. Three queue variants
//! cover three throughput and contention regimes:
//!
//! - [`MsQueue`]: unbounded linked queue (Michael-Scott). The general case.
//! - [`BasketQueue`]: unbounded linked queue (Hoffman-Shalev-Shavit) where
//!   contemporaneous producers share a "basket" instead of retrying, for
//!   very high producer concurrency.
//! - [`BoundedQueue`]: fixed-capacity ring (Tsigas-Zhang) for when an upper
//!   bound is known and array indexing beats pointer chasing.
//!
//! All three are linearizable and lock-free: every operation completes in a
//! bounded number of steps as long as some thread runs, with no locks and
//! no blocking. Operations that lose a race retry; threads that observe a
//! half-finished update by another thread help it forward. There are no
//! blocking wait primitives here; callers that need to park compose the
//! queues with their own signaling.
//!
//! FIFO order holds per insertion point: values from one producer come out
//! in the order they went in, while concurrent enqueues have no prescribed
//! mutual order (in the baskets queue they explicitly commute within a
//! basket). Each queue is linearizable on its own; nothing orders distinct
//! queues.
//!
//! Internally the queues defeat ABA with counter-tagged references updated
//! by double-width CAS, and reclaim unlinked nodes through hazard pointers,
//! so a payload handed out by `dequeue` can never be observed dangling
//! through the queue.

mod basket_queue;
mod bounded_queue;
mod hazard;
mod ms_queue;
mod tagged;

pub use basket_queue::BasketQueue;
pub use bounded_queue::BoundedQueue;
pub use ms_queue::MsQueue;
