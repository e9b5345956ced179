use criterion::{black_box, criterion_group, criterion_main, Criterion};
use trino_gateway::config::LoadWeights;
use trino_gateway::core::balancer::{routable_members, select, RoundRobin};
use trino_gateway::core::{Backend, ClientAttributes, Policy, RoutingStrategy, RuleType, Scheme};
use trino_gateway::health::ClusterLoadStats;
use trino_gateway::policy::evaluate_groups_for_client;

fn policies() -> Vec<Policy> {
    let mut policies = Vec::new();
    for i in 0..50u16 {
        policies.push(Policy::new(
            format!("port-{}", i),
            RuleType::ListeningPort,
            (8080 + i).to_string(),
            format!("group-{}", i % 5),
        ));
        policies.push(Policy::new(
            format!("tags-{}", i),
            RuleType::HeaderClientTags,
            format!("team-{}", i),
            format!("group-{}", i % 5),
        ));
    }
    policies
}

fn criterion_benchmark(c: &mut Criterion) {
    let policies = policies();
    let attrs = ClientAttributes {
        port: 8082,
        host: "gateway.example.com".to_string(),
        client_tags: "team-7".to_string(),
        connection_properties: String::new(),
    };

    c.bench_function("evaluate_groups_for_client", |b| {
        b.iter(|| black_box(evaluate_groups_for_client(black_box(&policies), black_box(&attrs))))
    });

    let backends: Vec<Backend> = (0..16)
        .map(|i| {
            let mut backend =
                Backend::new(format!("trino-{:02}", i), format!("10.0.0.{}:8080", i), Scheme::Http);
            backend.healthy = true;
            backend
        })
        .collect();
    let cursor = RoundRobin::new();

    c.bench_function("round_robin", |b| {
        b.iter(|| {
            let members = routable_members(black_box(&backends));
            black_box(select(RoutingStrategy::RoundRobin, &cursor, &members).map(|b| b.id.clone()))
        })
    });

    let stats = ClusterLoadStats::from_state_counts([
        ("QUEUED", 120),
        ("RUNNING", 40),
        ("PLANNING", 3),
        ("FINISHING", 1),
    ]);
    let weights = LoadWeights::default();

    c.bench_function("cluster_load", |b| {
        b.iter(|| black_box(black_box(&stats).load(&weights)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
