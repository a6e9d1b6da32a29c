// End-to-end runs through the public surface: compile a script, run
// a simulation, inspect exported rows.

use std::sync::Arc;

use joshsim::compiler::compile_source;
use joshsim::export::MemoryExporter;
use joshsim::external::{MapConfig, TableResource};
use joshsim::scheduler::{
    run_replicates, Collaborators, RunOptions, Simulation, Threading,
};
use joshsim::units::Units;
use joshsim::value::EngineValue;

fn run_with(
    source: &str,
    simulation: &str,
    collaborators: Collaborators,
    opts: RunOptions,
) -> MemoryExporter {
    let program = compile_source(source).unwrap();
    let mut exporter = MemoryExporter::new();
    let mut simulation =
        Simulation::new(&program, simulation, collaborators, opts).unwrap();
    simulation.run(&mut exporter).unwrap();
    exporter
}

fn run(source: &str, simulation: &str) -> MemoryExporter {
    run_with(
        source,
        simulation,
        Collaborators::default(),
        RunOptions::default(),
    )
}

#[test]
fn counter_reaches_five_years() {
    let exporter = run(
        "\
start simulation Main
  steps.low = 0 count
  steps.high = 5 count
end simulation

start patch Default
  trees.init = create 10 count of ForeverTree
end patch

start organism ForeverTree
  age.init = 0 year
  age.step = prior.age + 1 year
end organism
",
        "Main",
    );
    let final_rows: Vec<&String> = exporter
        .rows
        .iter()
        .filter(|row| row.starts_with("5,0,ForeverTree"))
        .collect();
    assert_eq!(final_rows.len(), 10);
    for row in final_rows {
        assert!(row.contains("age=5 year"), "row: {}", row);
    }
}

#[test]
fn unit_stanza_supports_casts_in_handlers() {
    let exporter = run(
        "\
start unit km
  alias kilometers
  m = current * 1000
end unit

start simulation Main
  steps.low = 0 count
  steps.high = 0 count
end simulation

start patch Default
  span.init = 2 km as m
end patch
",
        "Main",
    );
    let row = exporter
        .rows
        .iter()
        .find(|row| row.starts_with("0,0,Default"))
        .unwrap();
    assert!(row.contains("span=2000 m"), "row: {}", row);
}

#[test]
fn config_lookup_prefers_host_values() {
    let source = "\
start simulation Main
  steps.low = 0 count
  steps.high = 0 count
end simulation

start patch Default
  cap.init = config maxTrees else 5 count
end patch
";
    let absent = run(source, "Main");
    let row = absent
        .rows
        .iter()
        .find(|row| row.starts_with("0,0,Default"))
        .unwrap();
    assert!(row.contains("cap=5 count"), "row: {}", row);

    let mut config = MapConfig::new();
    config.insert("maxTrees", EngineValue::Int(7, Units::atom("count")));
    let present = run_with(
        source,
        "Main",
        Collaborators {
            config: Arc::new(config),
            ..Collaborators::default()
        },
        RunOptions::default(),
    );
    let row = present
        .rows
        .iter()
        .find(|row| row.starts_with("0,0,Default"))
        .unwrap();
    assert!(row.contains("cap=7 count"), "row: {}", row);
}

#[test]
fn script_config_defaults_sit_under_host_config() {
    let source = "\
config burnRate = 3 count

start simulation Main
  steps.low = 0 count
  steps.high = 0 count
end simulation

start patch Default
  rate.init = config burnRate
end patch
";
    let exporter = run(source, "Main");
    let row = exporter
        .rows
        .iter()
        .find(|row| row.starts_with("0,0,Default"))
        .unwrap();
    assert!(row.contains("rate=3 count"), "row: {}", row);
}

#[test]
fn external_resource_feeds_distributions() {
    let mut table = TableResource::new();
    table.insert(
        "rainfall",
        vec![
            bigdecimal::BigDecimal::from(10),
            bigdecimal::BigDecimal::from(20),
        ],
        Units::atom("mm"),
    );
    let exporter = run_with(
        "\
start simulation Main
  steps.low = 0 count
  steps.high = 0 count
end simulation

start patch Default
  rain.init = mean(external[rainfall])
  first.init = mean(external[rainfall] at 0)
end patch
",
        "Main",
        Collaborators {
            external: Arc::new(table),
            ..Collaborators::default()
        },
        RunOptions::default(),
    );
    let row = exporter
        .rows
        .iter()
        .find(|row| row.starts_with("0,0,Default"))
        .unwrap();
    assert!(row.contains("rain=15 mm"), "row: {}", row);
    assert!(row.contains("first=10 mm"), "row: {}", row);
}

#[test]
fn spatial_queries_span_patches() {
    let exporter = run(
        "\
start simulation Main
  steps.low = 0 count
  steps.high = 1 count
  grid.width = 2
  grid.height = 1
  grid.size = 10 m
end simulation

start patch Default
  trees.init = create 2 count of Tree
  near.step = count(Tree within 100 m)
end patch

start organism Tree
  age.init = 0 year
  age.step = prior.age + 1 year
end organism
",
        "Main",
    );
    let rows: Vec<&String> = exporter
        .rows
        .iter()
        .filter(|row| row.starts_with("1,0,Default"))
        .collect();
    assert_eq!(rows.len(), 2);
    for row in rows {
        // Two live members here plus two snapshots from the other
        // patch in range.
        assert!(row.contains("near=4"), "row: {}", row);
    }
}

#[test]
fn replicates_are_independent_and_deterministic() {
    let source = "\
start simulation Main
  steps.low = 0 count
  steps.high = 3 count
end simulation

start patch Default
  noise.init = sample uniform from 0 m to 1 m
  noise.step = sample uniform from 0 m to 1 m
end patch
";
    let program = compile_source(source).unwrap();

    let run_batch = |threading: Threading| {
        let mut exporter = MemoryExporter::new();
        run_replicates(
            &program,
            "Main",
            Collaborators::default(),
            RunOptions {
                seed: 11,
                threading,
                ..RunOptions::default()
            },
            2,
            &mut exporter,
        )
        .unwrap();
        exporter.joined()
    };

    let single = run_batch(Threading::Single);
    let parallel = run_batch(Threading::Parallel);
    assert_eq!(single, parallel);

    // Replicates appear under their own index and differ in noise.
    assert!(single.lines().any(|l| l.starts_with("0,0,Default")));
    assert!(single.lines().any(|l| l.starts_with("0,1,Default")));
    let first: Vec<&str> = single
        .lines()
        .filter(|l| l.starts_with("3,0,Default"))
        .collect();
    let second: Vec<&str> = single
        .lines()
        .filter(|l| l.starts_with("3,1,Default"))
        .collect();
    assert_ne!(first, second);
}
