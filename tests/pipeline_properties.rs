//! End-to-end properties of planning, policy aggregation and execution.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use strata::credentials::{AuthToken, StaticCredentialProvider};
use strata::dag::{ExecutorConfig, ExplicitStage, StageExecutor, StageScheduler};
use strata::errors::{GraphError, HandleError, ProvisioningError};
use strata::naming::Environment;
use strata::pipeline::{Pipeline, PipelineDefinition, PipelineOrchestrator};
use strata::policy::PolicyAggregator;
use strata::provision::{ProvisionContext, Provisioner, SimulatedProvisioner, StackDefinition};
use strata::resource::{ResourceHandle, ResourceKind};
use strata::stack::Stack;

const ACCOUNT: &str = "123456789012";
const REGION: &str = "us-east-1";

fn env() -> Environment {
    Environment::new("dev", ACCOUNT, REGION, "acme")
}

fn ctx() -> ProvisionContext {
    ProvisionContext {
        stage: "dev".to_string(),
        token: AuthToken::new("token"),
        deadline: None,
    }
}

/// A diamond with a tail: dynamo and bucket feed service, service feeds api.
fn diamond() -> Vec<Stack> {
    let table = ResourceHandle::create(ResourceKind::Table, "orders");
    let bucket = ResourceHandle::create(ResourceKind::Bucket, "assets");
    let function = ResourceHandle::create(ResourceKind::Function, "service-fn");

    let mut dynamo = Stack::new("dynamo", REGION, ACCOUNT);
    dynamo.declare_produced(table.clone());
    let mut s3 = Stack::new("bucket", REGION, ACCOUNT);
    s3.declare_produced(bucket.clone());
    let mut service = Stack::new("service", REGION, ACCOUNT);
    service.declare_consumed(table);
    service.declare_consumed(bucket);
    service.declare_produced(function.clone());
    let mut api = Stack::new("api", REGION, ACCOUNT);
    api.declare_consumed(function);

    vec![api, service, s3, dynamo]
}

#[test]
fn test_every_consumer_runs_in_a_later_stage_than_its_producer() {
    let stacks = diamond();
    let edges: Vec<(String, String)> = stacks
        .iter()
        .flat_map(|s| {
            s.dependencies(stacks.iter())
                .into_iter()
                .map(|d| (s.name().to_string(), d.name().to_string()))
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(edges.len(), 3);

    let pipeline = Pipeline::build(stacks, &[]).unwrap();
    for (consumer, producer) in &edges {
        let c = pipeline.stage_of(consumer).unwrap();
        let p = pipeline.stage_of(producer).unwrap();
        assert!(p < c, "{} (stage {}) must precede {} (stage {})", producer, p, consumer, c);
    }

    let sample = Pipeline::from_definition(&PipelineDefinition::sample(), &env()).unwrap();
    for stack in sample.stacks() {
        for dependency in stack.dependencies(sample.stacks().iter().map(|s| &**s)) {
            assert!(sample.stage_of(dependency.name()) < sample.stage_of(stack.name()));
        }
    }
}

#[test]
fn test_mutual_consumption_is_a_cycle_with_no_stages() {
    let a_out = ResourceHandle::create(ResourceKind::Table, "a-out");
    let b_out = ResourceHandle::create(ResourceKind::Table, "b-out");

    let mut a = Stack::new("a", REGION, ACCOUNT);
    a.declare_produced(a_out.clone());
    a.declare_consumed(b_out.clone());
    let mut b = Stack::new("b", REGION, ACCOUNT);
    b.declare_produced(b_out);
    b.declare_consumed(a_out);

    let err = Pipeline::build(vec![a, b], &[]).unwrap_err();
    match err {
        GraphError::DependencyCycle { stacks } => {
            assert!(stacks.contains(&"a".to_string()));
            assert!(stacks.contains(&"b".to_string()));
        }
        other => panic!("expected a dependency cycle, got {other}"),
    }
}

#[test]
fn test_building_twice_gives_identical_plans_and_roles() {
    let first = Pipeline::from_definition(&PipelineDefinition::sample(), &env()).unwrap();
    let second = Pipeline::from_definition(&PipelineDefinition::sample(), &env()).unwrap();
    assert_eq!(first.stages(), second.stages());
    assert_eq!(first.fingerprint(), second.fingerprint());

    let waves = |stacks: Vec<Stack>| {
        StageScheduler::from_stacks(stacks.into_iter().map(Arc::new).collect())
            .unwrap()
            .compute_waves()
            .unwrap()
    };
    assert_eq!(waves(diamond()), waves(diamond()));

    let role_of = |pipeline: &Pipeline| {
        for stack in pipeline.stacks() {
            for handle in stack.produced() {
                handle.resolve(format!("arn:{}", handle.id())).unwrap();
            }
        }
        pipeline.stack("permission").unwrap().role().unwrap().build(&env()).unwrap()
    };
    assert_eq!(role_of(&first), role_of(&second));
}

#[test]
fn test_aggregated_scopes_are_exactly_the_produced_handles() {
    let t1 = ResourceHandle::create(ResourceKind::Table, "t1").with_extra_scopes(["index/*"]);
    let b1 = ResourceHandle::create(ResourceKind::Bucket, "b1");
    let mut dynamo = Stack::new("dynamo", REGION, ACCOUNT);
    dynamo.declare_produced(t1.clone());
    let mut s3 = Stack::new("bucket", REGION, ACCOUNT);
    s3.declare_produced(b1.clone());

    let mut aggregator = PolicyAggregator::new("lambda-role");
    aggregator.add_source(&dynamo, &[t1.clone()], ["dynamodb:*"]).unwrap();
    aggregator.add_source(&s3, &[b1.clone()], ["s3:*"]).unwrap();

    t1.resolve("arn:aws:dynamodb:us-east-1:123456789012:table/T1").unwrap();
    b1.resolve("arn:aws:s3:::B1").unwrap();

    let role = aggregator.build().unwrap();
    assert_eq!(
        role.scopes_for("dynamodb:*"),
        BTreeSet::from([
            "arn:aws:dynamodb:us-east-1:123456789012:table/T1",
            "arn:aws:dynamodb:us-east-1:123456789012:table/T1/index/*",
        ])
    );
    assert_eq!(role.scopes_for("s3:*"), BTreeSet::from(["arn:aws:s3:::B1/*"]));
}

#[tokio::test]
async fn test_reading_a_handle_before_its_producer_runs_is_rejected() {
    let table = ResourceHandle::create(ResourceKind::Table, "orders");
    let mut dynamo = Stack::new("dynamo", REGION, ACCOUNT);
    dynamo.declare_produced(table.clone());

    assert_eq!(
        table.read().unwrap_err(),
        HandleError::UnresolvedReference {
            handle: "orders".to_string()
        }
    );

    let outcome = dynamo.execute(&env(), &SimulatedProvisioner::new(), &ctx()).await.unwrap();
    let expected =
        SimulatedProvisioner::identifier(ResourceKind::Table, REGION, ACCOUNT, "acme-orders-dev");
    assert_eq!(outcome.resolved["orders"], expected);
    assert_eq!(table.read().unwrap(), expected);
    assert_eq!(table.read().unwrap(), expected);
}

/// Fails the stacks it is told to, delegating the rest.
struct FailingProvisioner {
    failing: Vec<String>,
    inner: SimulatedProvisioner,
}

#[async_trait]
impl Provisioner for FailingProvisioner {
    async fn provision(
        &self,
        definition: &StackDefinition,
        ctx: &ProvisionContext,
    ) -> Result<HashMap<String, String>, ProvisioningError> {
        if self.failing.contains(&definition.name) {
            return Err(ProvisioningError::failed(&definition.name, "quota exceeded"));
        }
        self.inner.provision(definition, ctx).await
    }
}

#[tokio::test]
async fn test_one_failure_in_a_wave_fails_the_stage_and_stops_the_pipeline() {
    let stack = |name: &str| {
        let mut s = Stack::new(name, REGION, ACCOUNT);
        s.declare_produced(ResourceHandle::create(ResourceKind::Table, format!("{}-table", name)));
        s
    };
    let stacks = vec![stack("a"), stack("b"), stack("c"), stack("d")];
    let explicit = [
        ExplicitStage::new("First", ["a", "b", "c"]),
        ExplicitStage::new("Second", ["d"]),
    ];
    let pipeline = PipelineOrchestrator::build(stacks, &explicit).unwrap();
    assert_eq!(pipeline.stages()[0].waves.len(), 1);

    let provisioner = Arc::new(FailingProvisioner {
        failing: vec!["b".to_string()],
        inner: SimulatedProvisioner::new(),
    });
    let executor = StageExecutor::new(
        ExecutorConfig::default(),
        env(),
        provisioner.clone(),
        Arc::new(StaticCredentialProvider::new(AuthToken::new("token"))),
    );

    let result = PipelineOrchestrator::new(executor).run(pipeline).await.unwrap();
    assert!(!result.success);

    let first = &result.stages[0];
    assert!(!first.success());
    let outcome: HashMap<&str, bool> =
        first.stacks().map(|r| (r.stack.as_str(), r.success)).collect();
    assert_eq!(outcome, HashMap::from([("a", true), ("b", false), ("c", true)]));

    assert!(result.stages[1].skipped());
    assert!(!provisioner.inner.history().contains(&"d".to_string()));

    let failed = result.failed_stage().unwrap();
    assert_eq!(failed.name, "First");
    assert_eq!(failed.failures().len(), 1);
    assert_eq!(failed.failures()[0].stack, "b");
}
