#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use promemu_core::events::{Event, EventData, HandlerFn};
    use promemu_core::scenarios::CalcFn;
    use promemu_core::{
        Clock, EventBus, HostConfig, MetricConfig, MetricContext, MetricType, Mixer, MixerConfig,
        ScenarioSpec, ValidationError,
    };
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay_handler(target: &'static str, source: &'static str) -> HandlerFn {
        Arc::new(move |event: Event, bus: EventBus| {
            Box::pin(async move {
                bus.emit(target, EventData::Forwarded(Box::new(event.data)), source).await;
            })
        })
    }

    /// Mirrors the `hosts_load_with_peaks` population's balancer/worker
    /// shape: a balancer host relays its `feature_on` into `peak_load_start`,
    /// and a worker host's metric is subscribed to that derived event and
    /// jumps to a new value the moment it fires, without waiting for its own
    /// tick.
    #[tokio::test]
    async fn event_relay_drives_a_listening_metric_on_another_host() {
        let balancer = Arc::new(
            HostConfig::builder("balancer")
                .interval_range((0.02, 0.02))
                .listen_event("feature_on", relay_handler("peak_load_start", "balancer"))
                .metric(
                    MetricConfig::builder("heavy_task_active", MetricType::Gauge)
                        .value_range((0.0, 1.0))
                        .update_interval(0.0)
                        .scenario(ScenarioSpec::FeatureToggle {
                            start_time: 0.0,
                            duration: 5.0,
                            interval: 5.0,
                            on_value: 1.0,
                            off_value: 0.0,
                            source: Some("balancer".to_string()),
                        })
                        .build(),
                )
                .build(),
        );

        let mut bump_on_peak: HashMap<String, CalcFn> = HashMap::new();
        bump_on_peak.insert(
            "peak_load_start".to_string(),
            Arc::new(|_ctx: &MetricContext| -> Result<Option<f64>, ValidationError> {
                Ok(Some(99.0))
            }),
        );

        let worker = Arc::new(
            HostConfig::builder("worker")
                .interval_range((3600.0, 3600.0))
                .metric(
                    MetricConfig::builder("cpu", MetricType::Gauge)
                        .value_range((0.0, 100.0))
                        .init_value(5.0)
                        .update_interval(3600.0)
                        .listen_events(["peak_load_start"])
                        .scenario(ScenarioSpec::CalcByEvent {
                            events_config: bump_on_peak,
                        })
                        .build(),
                )
                .build(),
        );

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": [],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = MixerConfig::builder(vec![balancer, worker])
            .pushgateway_url(server.uri())
            .push_interval(0.05)
            .cleanup_on_finish(false)
            .build();

        let mixer = Mixer::new(config, EventBus::new(), Clock::new_mock(0)).await.unwrap();
        mixer.start().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        mixer.stop().await;

        let requests = server
            .received_requests()
            .await
            .expect("mock server records requests");
        let saw_bumped_cpu = requests.iter().any(|req| {
            req.method.as_str() == "POST"
                && String::from_utf8_lossy(&req.body).contains("cpu 99")
        });
        assert!(saw_bumped_cpu, "worker's cpu gauge never reflected the relayed peak_load_start event");
    }

    /// Two hosts sharing a job, driven end to end through `Mixer::start`:
    /// one automatic push cycle merges both hosts' samples under the same
    /// metric name.
    #[tokio::test]
    async fn two_hosts_in_one_job_push_merged_samples() {
        let host = |name: &'static str| {
            Arc::new(
                HostConfig::builder(name)
                    .interval_range((0.01, 0.01))
                    .metric(
                        MetricConfig::builder("cpu", MetricType::Gauge)
                            .value_range((0.0, 100.0))
                            .update_interval(0.0)
                            .scenario(ScenarioSpec::RandomInRange {
                                value_range: Some((42.0, 42.0)),
                            })
                            .build(),
                    )
                    .build(),
            )
        };

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": [],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = MixerConfig::builder(vec![host("host-a"), host("host-b")])
            .pushgateway_url(server.uri())
            .push_interval(0.05)
            .cleanup_on_finish(false)
            .build();

        let mixer = Mixer::new(config, EventBus::new(), Clock::new_mock(0)).await.unwrap();
        mixer.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = mixer.status().await;
        assert_eq!(status.total_hosts, 2);
        assert_eq!(status.active_hosts, 2);
        assert_eq!(status.total_metrics, 1);

        mixer.stop().await;

        let requests = server.received_requests().await.expect("mock server records requests");
        let posts: Vec<_> = requests.iter().filter(|r| r.method.as_str() == "POST").collect();
        assert!(!posts.is_empty(), "expected at least one push to the gateway");
        let body = String::from_utf8_lossy(&posts[0].body).into_owned();
        assert_eq!(body.matches("cpu{").count(), 2, "expected both hosts' cpu samples in one push");
    }
}
