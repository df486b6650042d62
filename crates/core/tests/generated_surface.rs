use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use xprofile::prelude::*;
use xprofile::testing::LoopbackBinder;
use xprofile::{CallbackEvent, EntryPoint, Error, channel_sink, generate};

cross_profile_type! {
	pub service Notes {
		connector: "notes",
		policy: NotifyRethrow,
		primary_profile: Work,
		methods {
			#[cacheable]
			fn count(#[key] folder: String, verbose: bool) -> u32;
			fn rename(from: String, to: String) -> Vec<String>;
			fn sync(force: bool, #[callback] progress);
			fn reset();
		}
	}
}

cross_profile_type! {
	service Clock {
		policy: NotifySuppress,
		primary_profile: None,
		methods {
			fn now() -> u64;
		}
	}
}

struct Store {
	profile: Profile,
	folders: BTreeMap<String, u32>,
	counted: Arc<AtomicUsize>,
}

impl Store {
	fn new(profile: Profile, counted: Arc<AtomicUsize>) -> Self {
		let base = if profile == Profile::Work { 10 } else { 1 };
		Self {
			profile,
			folders: BTreeMap::from([("inbox".to_string(), base), ("archive".to_string(), base * 2)]),
			counted,
		}
	}
}

#[async_trait]
impl NotesTarget for Store {
	async fn count(&self, folder: String, _verbose: bool) -> Result<u32, MethodFailure> {
		self.counted.fetch_add(1, Ordering::SeqCst);
		self.folders.get(&folder).copied().ok_or_else(|| MethodFailure::new("NoSuchFolder", folder))
	}

	async fn rename(&self, from: String, to: String) -> Result<Vec<String>, MethodFailure> {
		Ok(vec![from, to, self.profile.as_str().to_string()])
	}

	async fn sync(&self, force: bool, progress: CallbackHandle) -> Result<(), MethodFailure> {
		progress.notify("synced", json!(self.folders.len()));
		progress.complete(json!(force));
		Ok(())
	}

	async fn reset(&self) -> Result<(), MethodFailure> {
		if self.profile == Profile::Work {
			return Err(MethodFailure::new("ReadOnly", "work notes are managed"));
		}
		Ok(())
	}
}

struct World {
	binder: Arc<LoopbackBinder>,
	notes: NotesProfiles,
	local_counts: Arc<AtomicUsize>,
	remote_counts: Arc<AtomicUsize>,
}

fn world(current: Profile, primary: ProfileType) -> World {
	let local_counts = Arc::new(AtomicUsize::new(0));
	let remote_counts = Arc::new(AtomicUsize::new(0));

	let endpoint = ServiceEndpoint::new(current.other());
	endpoint.register(Notes::NAME, Notes::adapter(Store::new(current.other(), Arc::clone(&remote_counts))));
	let binder = LoopbackBinder::new();
	binder.register(endpoint);
	let binder = Arc::new(binder);

	let config = ConnectorConfig::new("notes")
		.with_primary_profile(primary)
		.with_idle_timeout(Duration::from_secs(5));
	let connector = ProfileConnector::new(config, Arc::new(StaticProfileHost::new(current)), binder.clone());
	let notes = Notes::create_with_local(connector, Store::new(current, Arc::clone(&local_counts))).unwrap();

	World {
		binder,
		notes,
		local_counts,
		remote_counts,
	}
}

#[test]
fn macro_builds_matching_descriptor() {
	let descriptor = Notes::descriptor().unwrap();
	assert_eq!(Notes::NAME, "Notes");
	assert_eq!(Notes::PRIMARY_PROFILE, Some(ProfileType::Work));
	assert_eq!(descriptor.connector(), Some("notes"));
	assert_eq!(descriptor.declared_policy(), Some(UncaughtExceptionPolicy::NotifyRethrow));

	let count = descriptor.method("count").unwrap();
	assert!(count.cacheable);
	assert_eq!(count.returns.as_deref(), Some("u32"));
	assert_eq!(count.key_indices(), vec![0]);

	let sync = descriptor.method("sync").unwrap();
	assert!(sync.is_void());
	assert_eq!(sync.value_arity(), 1);
	assert_eq!(sync.callback_slots(), vec![1]);

	let rename = descriptor.method("rename").unwrap();
	assert_eq!(rename.returns.as_deref(), Some("Vec<String>"));
}

#[test]
fn macro_plan_matches_runtime_generator() {
	let plan = generate(&Notes::descriptor().unwrap(), None);
	assert!(plan.has(EntryPoint::Suppliers));
	assert_eq!(plan.method("count").unwrap().cache_key, vec!["folder".to_string()]);
	assert_eq!(plan.method("sync").unwrap().callbacks, vec!["progress".to_string()]);

	let clock = Clock::descriptor().unwrap();
	assert_eq!(Clock::PRIMARY_PROFILE, Some(ProfileType::None));
	let unconfigured = generate(&clock, Some(&ConnectorConfig::new("clock")));
	assert!(!unconfigured.has(EntryPoint::Primary));
	assert_eq!(unconfigured.policy, UncaughtExceptionPolicy::NotifySuppress);
}

#[tokio::test]
async fn typed_single_calls_decode_results() {
	let world = world(Profile::Personal, ProfileType::Work);

	assert_eq!(world.notes.current().count("inbox".into(), false).await.unwrap(), Some(1));
	assert_eq!(world.notes.other().count("inbox".into(), false).await.unwrap(), Some(10));
	assert_eq!(world.notes.primary().count("archive".into(), true).await.unwrap(), Some(20));
	assert_eq!(world.notes.secondary().target().unwrap(), Profile::Personal);

	let renamed = world.notes.work().rename("a".into(), "b".into()).await.unwrap();
	assert_eq!(renamed, Some(vec!["a".to_string(), "b".to_string(), "WORK".to_string()]));
}

#[tokio::test]
async fn typed_cache_ignores_non_key_arguments() {
	let world = world(Profile::Personal, ProfileType::Work);

	world.notes.work().count("inbox".into(), false).await.unwrap();
	world.notes.work().count("inbox".into(), true).await.unwrap();
	assert_eq!(world.remote_counts.load(Ordering::SeqCst), 1);

	world.notes.clear_cache();
	world.notes.work().count("inbox".into(), true).await.unwrap();
	assert_eq!(world.remote_counts.load(Ordering::SeqCst), 2);
	assert_eq!(world.local_counts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn typed_fanout_collects_per_profile() {
	let world = world(Profile::Personal, ProfileType::Work);

	let counts = world.notes.both().count("archive".into(), false).await.unwrap();
	assert_eq!(counts.len(), 2);
	assert_eq!(counts[&Profile::Personal].as_ref().unwrap(), &Some(2));
	assert_eq!(counts[&Profile::Work].as_ref().unwrap(), &Some(20));

	let missing = world.notes.profiles([Profile::Work]).count("drafts".into(), false).await.unwrap();
	let err = missing[&Profile::Work].as_ref().unwrap_err();
	assert_eq!(err.as_remote().unwrap().cause().class_name(), Some("NoSuchFolder"));

	let suppliers = world.notes.suppliers().count("inbox".into(), false).await.unwrap();
	assert_eq!(suppliers.keys().copied().collect::<Vec<_>>(), vec![Profile::Personal]);
}

#[tokio::test]
async fn typed_void_methods_and_callbacks() {
	let world = world(Profile::Work, ProfileType::Work);

	let (sink, mut events) = channel_sink();
	assert_eq!(world.notes.personal().sync(true, sink).await.unwrap(), Some(()));

	let mut seen = Vec::new();
	loop {
		let event = events.recv().await.expect("callback event");
		let done = event.is_terminal();
		seen.push(event);
		if done {
			break;
		}
	}
	assert!(matches!(&seen[0], CallbackEvent::Notification { event, payload, .. } if event == "synced" && payload == &json!(2)));
	assert!(matches!(&seen[1], CallbackEvent::Completed { profile: Profile::Personal, outcome: Ok(value) } if value == &json!(true)));

	assert_eq!(world.notes.personal().reset().await.unwrap(), Some(()));
	let err = world.notes.current().reset().await.unwrap_err();
	assert!(err.is_remote_invocation());
	assert_eq!(world.binder.bind_count(Profile::Personal), 1);
}

#[tokio::test]
async fn typed_listeners_see_failures() {
	let world = world(Profile::Personal, ProfileType::Work);
	let seen = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&seen);
	world.notes.on_uncaught_failure(move |exception| {
		assert_eq!(exception.service(), "Notes");
		counter.fetch_add(1, Ordering::SeqCst);
	});

	let err = world.notes.work().reset().await.unwrap_err();
	assert!(matches!(err, Error::RemoteInvocation(_)));
	assert_eq!(seen.load(Ordering::SeqCst), 1);

	let results = world.notes.both().untyped().call("reset", vec![]).await.unwrap();
	assert!(results[&Profile::Personal].is_ok());
	assert!(results[&Profile::Work].is_err());
	assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn connector_must_match_declared_primary_profile() {
	for configured in [ProfileType::Personal, ProfileType::None] {
		let connector = ProfileConnector::new(
			ConnectorConfig::new("notes").with_primary_profile(configured),
			Arc::new(StaticProfileHost::new(Profile::Personal)),
			Arc::new(LoopbackBinder::new()),
		);
		let counted = Arc::new(AtomicUsize::new(0));

		let err = Notes::create_with_local(connector.clone(), Store::new(Profile::Personal, counted)).err().expect("mismatch rejected");
		assert!(matches!(err, Error::InvalidDescriptor(_)), "{err}");
		assert!(err.to_string().contains("Work"), "{err}");
		assert!(matches!(Notes::create(connector), Err(Error::InvalidDescriptor(_))));
	}
	assert_eq!(Notes::PRIMARY_PROFILE, Some(ProfileType::Work));
}

#[tokio::test]
async fn clock_without_roles_still_dispatches() {
	struct Fixed;

	#[async_trait]
	impl ClockTarget for Fixed {
		async fn now(&self) -> Result<u64, MethodFailure> {
			Ok(42)
		}
	}

	let connector = ProfileConnector::new(
		ConnectorConfig::new("clock"),
		Arc::new(StaticProfileHost::isolated(Profile::Personal)),
		Arc::new(LoopbackBinder::new()),
	);
	let clock = Clock::create_with_local(connector, Fixed).unwrap();

	assert_eq!(clock.current().now().await.unwrap(), Some(42));
	assert!(!clock.surface().entry_points().has(EntryPoint::Suppliers));

	let elsewhere = clock.other().now().await.unwrap_err();
	assert!(matches!(elsewhere, Error::ProfileUnavailable(Profile::Work)));
	let all = clock.both().now().await.unwrap();
	assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![Profile::Personal]);
}
