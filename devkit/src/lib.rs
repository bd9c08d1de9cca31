/*!
# fd-devkit - Test doubles for the fd-device agent

Lets the resolver, the dispatcher and the scheduler run without a broker,
a network or a real clock:
- Scripted broker publisher and reachability probe
- Loopback AMQP broker for exercising the real client
- Static name lookup
- Manual clock and counting jobs for the scheduler
- Resolver harness wiring the doubles together
*/

pub mod amqp_stub;
pub mod broker_stub;
pub mod test_utils;

pub use amqp_stub::{FakeBroker, PublishedMessage, AMQP_091_HEADER};
pub use broker_stub::{MockMessage, MockPublisher, ScriptedProbe};
pub use test_utils::{init_test_logging, CountingJob, ManualClock, ResolverHarness, StaticLookup};
