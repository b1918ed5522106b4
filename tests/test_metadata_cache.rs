mod fixtures;
use fixtures::*;

use std::sync::{Arc, Barrier};
use std::thread;

use pretty_assertions::assert_eq;
use wineventlog::{
    EventRenderer, LogRecord, Position, RenderConfig, Renderer, Session, SubscribeRequest,
    TypedValue, VariantArray,
};

fn read_handles(h: &Harness, channel: &str) -> Vec<wineventlog::RecordHandle> {
    h.session
        .subscribe(&SubscribeRequest::new(channel, Position::Fresh))
        .unwrap()
        .next(100)
        .unwrap()
}

#[test]
fn test_concurrent_renderers_load_metadata_once() {
    ensure_env_logger_initialized();
    let h = Harness::new();
    h.log.register_provider(service_provider());
    append_service_records(&h.log, "System", 40);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let session = Arc::clone(&h.session);
            let cache = Arc::clone(&h.cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let handles = session
                    .subscribe(&SubscribeRequest::new("System", Position::Fresh))
                    .unwrap()
                    .next(100)
                    .unwrap();
                let mut renderer = Renderer::new(session, cache, RenderConfig::default());
                barrier.wait();
                handles
                    .iter()
                    .map(|handle| renderer.render(handle.as_ref()).unwrap().event.message)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for worker in workers {
        let messages = worker.join().unwrap();
        assert_eq!(messages.len(), 40);
        assert_eq!(messages[3], "The svc3 service entered the running state.");
    }
    assert_eq!(h.log.publisher_metadata_opens(), 1);
    assert_eq!(h.cache.len(), 1);
}

#[test]
fn test_metadata_converges_per_fingerprint() {
    let h = Harness::new();
    h.log.register_provider(service_provider());
    append_service_records(&h.log, "System", 2);
    // Same event id, but the values have a different shape than the manifest declares.
    h.log.append(
        "System",
        LogRecord::new(SERVICE_PROVIDER, 7036)
            .value("ServiceName", TypedValue::String("Spooler".to_owned()))
            .value("State", TypedValue::UInt32(4))
            .value("Extra", TypedValue::Boolean(true)),
    );

    let handles = read_handles(&h, "System");
    let (store, err) = h.cache.get(SERVICE_PROVIDER);
    assert!(err.is_none());

    let mut resolved = Vec::new();
    let mut buf = Vec::new();
    for handle in &handles {
        let count = handle
            .render_values(wineventlog::RenderContext::User, &mut buf)
            .unwrap();
        let fingerprint = VariantArray::new(&buf, count).unwrap().fingerprint();
        resolved.push(store.resolve(7036, fingerprint, handle.as_ref()).unwrap());
    }

    assert!(Arc::ptr_eq(&resolved[0], &resolved[1]));
    assert!(Arc::ptr_eq(&resolved[0], store.declared(7036).unwrap()));
    assert!(!Arc::ptr_eq(&resolved[0], &resolved[2]));
    assert_eq!(
        resolved[2].params,
        vec!["ServiceName".to_owned(), "State".to_owned(), "Extra".to_owned()]
    );
    // The derived shape keeps the manifest's message.
    assert!(!resolved[2].message.is_none());

    // Rendering the odd-shaped record names its values from the record itself.
    let mut renderer = Renderer::new(
        Arc::clone(&h.session),
        Arc::clone(&h.cache),
        RenderConfig::default(),
    );
    let rendered = renderer.render(handles[2].as_ref()).unwrap();
    assert_eq!(rendered.event.event_data[0].key, "ServiceName");
    assert_eq!(rendered.event.event_data[2].value, "true");
    assert_eq!(
        rendered.event.message,
        "The Spooler service entered the 4 state."
    );
}

#[test]
fn test_missing_provider_degrades_to_raw_codes() {
    let h = Harness::new();
    h.log.append(
        "System",
        LogRecord::new("Vendor-Unknown", 12)
            .level(2)
            .task(9)
            .value("", TypedValue::String("x".to_owned())),
    );
    h.log.append("System", LogRecord::new("Vendor-Unknown", 12));

    let handles = read_handles(&h, "System");
    let mut renderer = Renderer::new(
        Arc::clone(&h.session),
        Arc::clone(&h.cache),
        RenderConfig::default(),
    );

    let first = renderer.render(handles[0].as_ref()).unwrap();
    assert_eq!(first.event.level, "Error");
    assert_eq!(first.event.task, "");
    assert_eq!(first.event.task_raw, 9);
    assert!(first
        .errors
        .iter()
        .any(|e| matches!(e, wineventlog::EventLogError::PublisherMetadata { .. })));

    // The failure is reported once; later records use the cached empty store.
    let second = renderer.render(handles[1].as_ref()).unwrap();
    assert!(!second
        .errors
        .iter()
        .any(|e| matches!(e, wineventlog::EventLogError::PublisherMetadata { .. })));
    assert_eq!(h.log.publisher_metadata_opens(), 1);
}
