use channel_targets_lib::models::{
    CreateTargetPayload, Metric, MetricSet, OverAllocationPolicy, QuarterMonthCheck, Role, SubjectType,
};
use channel_targets_lib::{CallerContext, PeriodInput, Quarter};

#[test]
fn bootstrap_applies_yaml_overrides_and_writes_logs() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("targets.yaml"),
        "overAllocationPolicy: reject\nquarterMonthCheck: \"off\"\nmaxListLimit: 50\n",
    )
    .expect("write overrides");

    let state = channel_targets_lib::bootstrap(dir.path()).expect("bootstrap");
    let settings = state.targets.settings().expect("settings");

    assert_eq!(settings.over_allocation_policy, OverAllocationPolicy::Reject);
    assert_eq!(settings.quarter_month_check, QuarterMonthCheck::Off);
    assert_eq!(settings.max_list_limit, 50);
    assert_eq!(settings.min_year, 2000);
    assert!(dir.path().join("targets.db").exists());
    assert!(dir.path().join("logs").is_dir());
}

#[test]
fn yaml_cache_ttl_applies_on_first_boot() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("targets.yaml"), "statisticsCacheTtlSeconds: 0\n").expect("write overrides");

    let state = channel_targets_lib::bootstrap(dir.path()).expect("bootstrap");
    let service = &state.targets;
    service.sync_user("admin", "Ada", Role::Admin).expect("user");
    service.sync_user("s1", "Sam", Role::Salesperson).expect("user");
    let admin = CallerContext::admin("admin");
    let target = service
        .create_target(
            &admin,
            CreateTargetPayload {
                subject_type: SubjectType::Person,
                subject_id: "s1".to_string(),
                period: PeriodInput::quarterly(2025, Quarter::Q2),
                quota: MetricSet::zero().with(Metric::NewSigning, 100.0),
                notes: None,
            },
        )
        .expect("target");

    let before = service.statistics(&admin, 2025, Some(Quarter::Q2)).expect("stats");
    assert_eq!(before.achieved.new_signing, 0.0);

    service
        .database()
        .set_target_achieved(&target.id, &MetricSet::zero().with(Metric::NewSigning, 50.0), "import")
        .expect("direct write")
        .expect("row exists");
    let after = service.statistics(&admin, 2025, Some(Quarter::Q2)).expect("stats");
    assert_eq!(after.achieved.new_signing, 50.0);
}
