mod support;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use render_cache::cache::{CacheConfig, RouteKeyPolicy, RoutePattern, VERSION_KEY};
use render_cache::render::{
    Redirect, RenderCoordinator, RenderError, RenderResult, RequestContext, StopReason,
};
use support::{CountingStore, Script, ScriptedRenderer, coordinator, host_context};

fn about_policy() -> RouteKeyPolicy {
    RouteKeyPolicy::new(vec![RoutePattern::prefix("/about"), RoutePattern::prefix("/login")])
}

#[tokio::test]
async fn bypassed_requests_touch_neither_store_nor_slots() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(ScriptedRenderer::new());
    let coordinator = coordinator(about_policy(), &store, &renderer);

    let admin = coordinator
        .handle("/admin", host_context())
        .await
        .expect("bypass render");
    let spa = coordinator
        .handle("/about", host_context().client_only(true))
        .await
        .expect("client-only render");
    let hostless = coordinator
        .handle("/about", RequestContext::new())
        .await
        .expect("hostless render");
    coordinator.settle_writes().await;

    assert_eq!(admin.html, "<p>/admin</p>");
    assert_eq!(spa.html, "<p>/about</p>");
    assert_eq!(hostless.html, "<p>/about</p>");
    assert_eq!(store.ops(), 0);
    assert_eq!(coordinator.slots().allocated(), 0);
    assert_eq!(renderer.completions(), 3);
}

#[tokio::test]
async fn about_is_rendered_once_then_served_from_cache() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(
        ScriptedRenderer::new().script("/about", Script::Page("<html>About</html>".to_string())),
    );
    let coordinator = coordinator(about_policy(), &store, &renderer);

    let first = coordinator
        .handle("/about", host_context())
        .await
        .expect("cold render");
    coordinator.settle_writes().await;

    assert_eq!(first.html, "<html>About</html>");
    assert_eq!(renderer.completions(), 1);
    assert_eq!(store.sets(), 1);
    assert_eq!(store.stored("/about").await, Some(first.clone()));

    let second = coordinator
        .handle("/about", host_context())
        .await
        .expect("warm request");
    coordinator.settle_writes().await;

    assert_eq!(second, first);
    assert_eq!(renderer.checkpoints(), 2);
    assert_eq!(renderer.completions(), 1);
    assert_eq!(store.sets(), 1);
    assert_eq!(coordinator.slots().in_use(), 0);

    // The stopped render reports back after the response was produced.
    tokio::task::yield_now().await;
    for _ in 0..50 {
        if !renderer.stops().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(renderer.stops(), vec![StopReason::CacheHit]);
}

#[tokio::test]
async fn redirects_are_answered_but_never_stored() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(
        ScriptedRenderer::new().script("/login", Script::Redirect(Redirect::to("/auth/sign-in"))),
    );
    let coordinator = coordinator(about_policy(), &store, &renderer);

    for _ in 0..2 {
        let result = coordinator
            .handle("/login", host_context())
            .await
            .expect("redirect");
        assert_eq!(result, RenderResult::redirect(Redirect::to("/auth/sign-in")));
        assert!(result.html.is_empty());
        assert!(result.error.is_none());
    }
    coordinator.settle_writes().await;

    assert_eq!(store.sets(), 0);
    assert_eq!(store.gets(), 0);
    assert_eq!(renderer.checkpoints(), 2);
    assert!(store.stored("/login").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redirect_and_page_on_same_key_never_cross() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(
        ScriptedRenderer::new()
            .script("/login", Script::Redirect(Redirect::to("/auth")))
            .script("/about", Script::Page("<html>About</html>".to_string())),
    );
    let shared_key = |_: &str, context: &RequestContext| {
        context.host.as_ref().map(|_| "shared".to_string())
    };
    let coordinator = Arc::new(coordinator(shared_key, &store, &renderer));

    for _ in 0..20 {
        let requests = ["/login", "/about", "/login", "/about"].map(|route| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let result = coordinator.handle(route, host_context()).await;
                (route, result)
            })
        });

        for joined in join_all(requests).await {
            let (route, result) = joined.expect("task joins");
            let result = result.expect("request succeeds");
            match route {
                "/login" => assert_eq!(result, RenderResult::redirect(Redirect::to("/auth"))),
                _ => assert_eq!(result.html, "<html>About</html>"),
            }
        }
    }
    coordinator.settle_writes().await;

    let stored = store.stored("shared").await.expect("page stored");
    assert!(stored.redirected.is_none());
    assert_eq!(stored.html, "<html>About</html>");
    assert_eq!(coordinator.slots().in_use(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slots_are_recycled_after_concurrent_requests() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(ScriptedRenderer::new().with_delay(Duration::from_millis(5)));
    let policy = RouteKeyPolicy::new(vec![RoutePattern::prefix("/p/")]);
    let coordinator = Arc::new(coordinator(policy, &store, &renderer));

    let requests = (0..32).map(|n| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.handle(&format!("/p/{n}"), host_context()).await })
    });
    for joined in join_all(requests).await {
        joined.expect("task joins").expect("render");
    }
    coordinator.settle_writes().await;

    let slots = coordinator.slots();
    assert_eq!(renderer.overlaps(), 0);
    assert_eq!(slots.in_use(), 0);
    assert!(slots.allocated() >= 1 && slots.allocated() <= 32);
    assert_eq!(slots.free_len(), slots.allocated());
    assert_eq!(store.sets(), 32);
}

#[tokio::test]
async fn failed_and_error_renders_are_not_cached() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(
        ScriptedRenderer::new()
            .script("/about/broken", Script::Fail("template missing".to_string()))
            .script("/about/oops", Script::ErrorPage("<h1>500</h1>".to_string())),
    );
    let coordinator = coordinator(about_policy(), &store, &renderer);

    let err = coordinator
        .handle("/about/broken", host_context())
        .await
        .expect_err("render fails");
    assert_eq!(err, RenderError::failed("template missing"));

    let page = coordinator
        .handle("/about/oops", host_context())
        .await
        .expect("error page is still a result");
    assert_eq!(page.error.as_deref(), Some("render error"));
    coordinator.settle_writes().await;

    assert_eq!(store.sets(), 0);
    assert_eq!(coordinator.slots().in_use(), 0);
}

#[tokio::test]
async fn renderer_panic_is_reported_as_error() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(ScriptedRenderer::new().script("/about", Script::Panic));
    let coordinator = coordinator(about_policy(), &store, &renderer);

    let err = coordinator
        .handle("/about", host_context())
        .await
        .expect_err("panic surfaces");

    assert_eq!(err, RenderError::Panicked("renderer exploded".to_string()));
    assert_eq!(coordinator.slots().in_use(), 0);
    assert_eq!(store.sets(), 0);
}

#[tokio::test]
async fn unavailable_store_degrades_to_rendering() {
    let store = Arc::new(CountingStore::offline());
    let renderer = Arc::new(ScriptedRenderer::new());
    let coordinator = coordinator(about_policy(), &store, &renderer);

    for _ in 0..2 {
        let result = coordinator
            .handle("/about", host_context())
            .await
            .expect("render despite store");
        assert_eq!(result.html, "<p>/about</p>");
    }
    coordinator.settle_writes().await;

    assert_eq!(renderer.completions(), 2);
    assert_eq!(store.gets(), 2);
    assert_eq!(store.sets(), 2);
}

#[tokio::test]
async fn render_without_checkpoint_is_returned_uncached() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(ScriptedRenderer::new().script("/about", Script::SkipCheckpoint));
    let coordinator = coordinator(about_policy(), &store, &renderer);

    let result = coordinator
        .handle("/about", host_context())
        .await
        .expect("render");
    coordinator.settle_writes().await;

    assert_eq!(result.html, "<p>unchecked /about</p>");
    assert_eq!(store.ops(), 0);
    assert_eq!(coordinator.slots().in_use(), 0);
}

#[tokio::test]
async fn abandoned_request_releases_slot_and_stops_render() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(ScriptedRenderer::new().with_delay(Duration::from_millis(100)));
    let coordinator = coordinator(about_policy(), &store, &renderer);

    let timed_out =
        tokio::time::timeout(Duration::from_millis(10), coordinator.handle("/about", host_context()))
            .await;
    assert!(timed_out.is_err());
    assert_eq!(coordinator.slots().in_use(), 0);

    for _ in 0..100 {
        if !renderer.stops().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(renderer.stops(), vec![StopReason::Abandoned]);
    assert_eq!(renderer.completions(), 0);
    coordinator.settle_writes().await;
    assert_eq!(store.sets(), 0);
}

#[tokio::test]
async fn first_request_persists_the_application_version() {
    let store = Arc::new(CountingStore::new());
    let renderer = Arc::new(ScriptedRenderer::new());
    let config = CacheConfig::new(about_policy()).with_version("1.1");
    let coordinator = RenderCoordinator::new(config, store.clone(), renderer.clone());

    coordinator.version_gate().reconcile().await;
    assert!(store.raw(VERSION_KEY).await.is_none());

    coordinator
        .handle("/admin", host_context())
        .await
        .expect("bypass render");
    coordinator.settle_writes().await;

    assert_eq!(store.raw(VERSION_KEY).await.as_deref(), Some(&b"1.1"[..]));
    assert!(coordinator.version_gate().is_persisted());

    coordinator
        .handle("/admin", host_context())
        .await
        .expect("bypass render");
    coordinator.settle_writes().await;
    assert_eq!(store.sets(), 1);
}
