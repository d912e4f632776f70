//! End-to-end dispatch behavior: constraint ordering, rejection routing,
//! throttling through the gate, and return-value middleware.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{dm_chat_event, guild_chat_event, RecordingNotifier};
use tollgate::{
    Channel, CooldownScope, DispatchMeta, Gate, GateEvent, Handler, ManualClock, Middleware,
    Notifier, PermLevel, PermissionResolver, Rejection, RecordingSink, StageBundle, StageControl,
    StagePhase, StaticResolver, TelemetrySink, Throttle,
};

type Ctx = tollgate::DispatchContext<String>;

fn counting_stage(label: &str, counter: Arc<AtomicUsize>) -> Middleware<Ctx, String> {
    Middleware::named(label, move |_ctx: &mut Ctx, ctl: &mut StageControl<String>| {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            ctl.next();
            Ok(None)
        })
    })
}

fn probe_handler() -> Handler<String> {
    Handler::builder("probe")
        .source("commands/util/probe.rs")
        .guild_only(false)
        .throttle(Throttle::disabled())
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(Some("ok".to_string())) }))
        .build()
        .expect("valid handler")
}

#[tokio::test]
async fn successful_dispatch_runs_the_handler_body() {
    let executed = Arc::new(AtomicUsize::new(0));
    let body_runs = Arc::clone(&executed);
    let handler = Handler::builder("probe")
        .source("commands/util/probe.rs")
        .guild_only(false)
        .throttle(Throttle::disabled())
        .run(move |_ctx: &mut Ctx| {
            let body_runs = Arc::clone(&body_runs);
            Box::pin(async move {
                body_runs.fetch_add(1, Ordering::SeqCst);
                Ok(Some("ok".to_string()))
            })
        })
        .build()
        .unwrap();
    let gate: Gate<String> = Gate::builder().build();

    let outcome = gate.dispatch_now(&handler, dm_chat_event("u1")).await;
    assert!(outcome.unwrap());
    assert_eq!(executed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permission_level_failure_wins_over_nsfw() {
    // The caller fails both the permission-level and the NSFW constraint;
    // only the permission-level rejection may be observable.
    let notifier = Arc::new(RecordingNotifier::new());
    let gate: Gate<String> = Gate::builder().notifier(notifier.clone() as Arc<dyn Notifier>).build();
    let handler = Handler::builder("mod-only")
        .source("commands/moderation/purge.rs")
        .perm_level(PermLevel::Moderator)
        .nsfw(true)
        .throttle(Throttle::disabled())
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
        .build()
        .unwrap();

    let event = guild_chat_event("u1", "g1", Channel::text("c1"));
    let outcome = gate.dispatch(&handler, event, DispatchMeta::default()).await;

    assert!(!outcome.unwrap());
    assert_eq!(
        notifier.rejections(),
        vec![Rejection::PermissionLevel {
            required: PermLevel::Moderator,
            actual: PermLevel::User,
        }]
    );
}

#[tokio::test]
async fn nsfw_rejection_surfaces_once_permission_level_passes() {
    let notifier = Arc::new(RecordingNotifier::new());
    let resolver = Arc::new(StaticResolver::new().with_level("u1", PermLevel::Moderator));
    let gate: Gate<String> =
        Gate::builder().notifier(notifier.clone() as Arc<dyn Notifier>).resolver(resolver as Arc<dyn PermissionResolver>).build();
    let handler = Handler::builder("mod-only")
        .source("commands/moderation/purge.rs")
        .perm_level(PermLevel::Moderator)
        .nsfw(true)
        .throttle(Throttle::disabled())
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
        .build()
        .unwrap();

    let event = guild_chat_event("u1", "g1", Channel::text("c1"));
    assert!(!gate.dispatch(&handler, event, DispatchMeta::default()).await.unwrap());

    let rejections = notifier.rejections();
    assert_eq!(rejections.len(), 1);
    assert!(matches!(rejections[0], Rejection::Nsfw(_)));
}

#[tokio::test]
async fn disabled_handler_is_rejected_before_anything_else() {
    let notifier = Arc::new(RecordingNotifier::new());
    let gate: Gate<String> = Gate::builder().notifier(notifier.clone() as Arc<dyn Notifier>).build();
    let handler = Handler::builder("retired")
        .source("commands/util/retired.rs")
        .enabled(false)
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
        .build()
        .unwrap();

    assert!(!gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert_eq!(notifier.rejections(), vec![Rejection::Disabled]);
}

#[tokio::test]
async fn guild_only_handler_rejects_dms() {
    let notifier = Arc::new(RecordingNotifier::new());
    let gate: Gate<String> = Gate::builder().notifier(notifier.clone() as Arc<dyn Notifier>).build();
    let handler = Handler::builder("guildly")
        .source("commands/util/guildly.rs")
        .throttle(Throttle::disabled())
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
        .build()
        .unwrap();

    assert!(!gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert_eq!(notifier.rejections(), vec![Rejection::GuildOnly]);
}

#[tokio::test]
async fn end_to_end_cooldown_scenario() {
    let clock = ManualClock::new();
    let notifier = Arc::new(RecordingNotifier::new());
    let gate: Gate<String> = Gate::builder()
        .clock(Arc::new(clock.clone()))
        .notifier(notifier.clone() as Arc<dyn Notifier>)
        .build();
    let handler = Handler::builder("heavy")
        .source("commands/util/heavy.rs")
        .guild_only(false)
        .throttle(Throttle::new().with_usages(1).with_duration(Duration::from_millis(2000)))
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
        .build()
        .unwrap();

    // t=0: admitted and executed.
    assert!(gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());

    // t=500: on cooldown with ~1500ms remaining.
    clock.set_millis(500);
    assert!(!gate
        .dispatch(&handler, dm_chat_event("u1"), DispatchMeta::invoked_at(500))
        .await
        .unwrap());
    assert_eq!(
        notifier.rejections(),
        vec![Rejection::Throttled {
            retry_after: Duration::from_millis(1500),
            scope: CooldownScope::User,
        }]
    );

    // t=2100: the usage aged out; admitted again.
    clock.set_millis(2100);
    assert!(gate
        .dispatch(&handler, dm_chat_event("u1"), DispatchMeta::invoked_at(2100))
        .await
        .unwrap());
}

#[tokio::test]
async fn failed_admission_does_not_consume_quota() {
    let gate: Gate<String> = Gate::builder().build();
    let handler = Handler::builder("guarded")
        .source("commands/util/guarded.rs")
        .throttle(Throttle::new().with_usages(1).with_duration(Duration::from_secs(60)))
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
        .build()
        .unwrap();

    // Rejected on guild-only grounds twice; neither attempt may take quota.
    assert!(!gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert!(!gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert_eq!(gate.throttles().len(), 0);

    // The first admitted call still fits the quota of one.
    let event = guild_chat_event("u1", "g1", Channel::text("c1"));
    assert!(gate.dispatch(&handler, event, DispatchMeta::default()).await.unwrap());
}

#[tokio::test]
async fn aliases_sharing_a_source_share_a_cooldown_bucket() {
    let gate: Gate<String> = Gate::builder().build();
    let throttle = Throttle::new().with_usages(1).with_duration(Duration::from_secs(60));
    let build = |name: &str| {
        Handler::builder(name)
            .source("commands/fun/eight_ball.rs")
            .guild_only(false)
            .throttle(throttle.clone())
            .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
            .build()
            .unwrap()
    };
    let original = build("eight-ball");
    let alias = build("8ball");

    assert!(gate.dispatch(&original, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    // The alias shares the origin hash, so it lands in the same bucket.
    assert!(!gate.dispatch(&alias, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
}

#[tokio::test]
async fn return_value_middleware_runs_only_on_matching_values() {
    let matched = Arc::new(AtomicUsize::new(0));
    let unmatched = Arc::new(AtomicUsize::new(0));
    let gate: Gate<String> = Gate::builder()
        .stages(
            StageBundle::new()
                .on_return_value("X".into(), vec![counting_stage("on-x", Arc::clone(&matched))])
                .on_return_value("Y".into(), vec![counting_stage("on-y", Arc::clone(&unmatched))]),
        )
        .build();
    let handler = Handler::builder("returns-x")
        .source("commands/util/returns_x.rs")
        .guild_only(false)
        .throttle(Throttle::disabled())
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(Some("X".to_string())) }))
        .build()
        .unwrap();

    assert!(gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert_eq!(matched.load(Ordering::SeqCst), 1);
    assert_eq!(unmatched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handler_fault_is_normalized_for_post_execution_stages() {
    let seen: Arc<std::sync::Mutex<Vec<(bool, Option<String>)>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_by_stage = Arc::clone(&seen);
    let observer = Middleware::named(
        "observe-result",
        move |ctx: &mut Ctx, ctl: &mut StageControl<String>| {
            let seen = Arc::clone(&seen_by_stage);
            Box::pin(async move {
                let result = ctx.result.as_ref().expect("post-execution stages see the result");
                seen.lock()
                    .unwrap()
                    .push((result.success, result.error.as_ref().map(|e| e.to_string())));
                ctl.next();
                Ok(None)
            })
        },
    );
    let sink = Arc::new(RecordingSink::new());
    let gate: Gate<String> = Gate::builder()
        .stages(StageBundle::new().post_execution(observer))
        .telemetry(sink.clone() as Arc<dyn TelemetrySink>)
        .build();
    let handler = Handler::builder("explodes")
        .source("commands/util/explodes.rs")
        .guild_only(false)
        .throttle(Throttle::disabled())
        .run(|_ctx: &mut Ctx| Box::pin(async { Err("kaboom".into()) }))
        .build()
        .unwrap();

    // A handler fault is absorbed: the dispatch itself completes.
    assert!(gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert_eq!(seen.lock().unwrap().as_slice(), [(false, Some("kaboom".to_string()))]);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, GateEvent::Executed { success: false, .. })));
}

#[tokio::test]
async fn middleware_fault_without_hook_is_fatal_to_the_run() {
    let gate: Gate<String> = Gate::builder()
        .stages(StageBundle::new().pre_check(Middleware::named(
            "miswired",
            |_ctx: &mut Ctx, ctl: &mut StageControl<String>| {
                Box::pin(async move {
                    ctl.next();
                    Err("wiring bug".into())
                })
            },
        )))
        .build();
    let handler = probe_handler();

    let err = gate
        .dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("miswired"));
}

#[tokio::test]
async fn pre_check_halt_is_reported_as_a_halt_not_a_rejection() {
    let notifier = Arc::new(RecordingNotifier::new());
    let sink = Arc::new(RecordingSink::new());
    let gate: Gate<String> = Gate::builder()
        .stages(StageBundle::new().pre_check(Middleware::named(
            "maintenance-mode",
            |_ctx: &mut Ctx, _ctl: &mut StageControl<String>| Box::pin(async move { Ok(None) }),
        )))
        .notifier(notifier.clone() as Arc<dyn Notifier>)
        .telemetry(sink.clone() as Arc<dyn TelemetrySink>)
        .build();
    let handler = probe_handler();

    assert!(!gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert!(notifier.rejections().is_empty());
    assert_eq!(
        sink.events(),
        vec![GateEvent::Halted { handler: "probe".into(), phase: StagePhase::PreChecks }]
    );
}

#[tokio::test]
async fn pre_throttle_stages_run_only_for_throttled_handlers() {
    let count = Arc::new(AtomicUsize::new(0));
    let gate: Gate<String> = Gate::builder()
        .stages(
            StageBundle::new().pre_throttle(counting_stage("defer-reply", Arc::clone(&count))),
        )
        .build();

    let unthrottled = probe_handler();
    assert!(gate
        .dispatch(&unthrottled, dm_chat_event("u1"), DispatchMeta::default())
        .await
        .unwrap());
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let throttled = Handler::builder("throttled")
        .source("commands/util/throttled.rs")
        .guild_only(false)
        .throttle(Throttle::new().with_usages(5).with_duration(Duration::from_secs(60)))
        .run(|_ctx: &mut Ctx| Box::pin(async { Ok(None) }))
        .build()
        .unwrap();
    assert!(gate
        .dispatch(&throttled, dm_chat_event("u1"), DispatchMeta::default())
        .await
        .unwrap());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn telemetry_reports_handler_runtime_on_the_gate_clock() {
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::new());
    let gate: Gate<String> = Gate::builder()
        .clock(Arc::new(clock.clone()))
        .telemetry(sink.clone() as Arc<dyn TelemetrySink>)
        .build();
    let timer = clock.clone();
    let handler = Handler::builder("slow")
        .source("commands/util/slow.rs")
        .guild_only(false)
        .throttle(Throttle::disabled())
        .run(move |_ctx: &mut Ctx| {
            let timer = timer.clone();
            Box::pin(async move {
                timer.advance(Duration::from_millis(25));
                Ok(None)
            })
        })
        .build()
        .unwrap();

    assert!(gate.dispatch(&handler, dm_chat_event("u1"), DispatchMeta::default()).await.unwrap());
    assert_eq!(
        sink.events(),
        vec![GateEvent::Executed { handler: "slow".into(), success: true, runtime_ms: 25 }]
    );
}
