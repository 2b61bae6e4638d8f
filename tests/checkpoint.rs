mod common;

use biggan::model::{
    architecture::{Discriminator, Generator, OrthogonalWeights},
    checkpoint::{Checkpointer, LoadOutcome},
    data::LoaderSource,
    ema::parameter_values,
    training::{TrainingState, UpdateCounters, init_state},
};
use burn::optim::{GradientsParams, Optimizer};
use common::{TestBackend, random_loader, tiny_config};

fn assert_same(left: &[Vec<f32>], right: &[Vec<f32>]) {
    assert_eq!(left.len(), right.len());
    for (a, b) in left.iter().zip(right) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-7);
        }
    }
}

#[test]
fn empty_directory_has_nothing_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path());
    let template = init_state::<TestBackend>(&config, &device);

    let outcome = Checkpointer::new(dir.path().join("none"), 5).load(&template, &device);
    assert!(matches!(outcome, LoadOutcome::NotFound));
}

#[test]
fn round_trip_restores_every_network() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path());
    let checkpointer = Checkpointer::new(dir.path().join("ckpt"), 5);

    let mut state = init_state::<TestBackend>(&config, &device);
    state.step = 42;
    state.counters = UpdateCounters {
        discriminator_updates: 84,
        generator_updates: 42,
        average_updates: 42,
    };
    let written = checkpointer.save(&state).unwrap();
    assert!(written.ends_with("step-00000042"));
    assert!(written.join("generator-ema.mpk").exists());
    assert!(written.join("optimizer-discriminator.mpk").exists());

    // A differently initialised template must be fully overwritten.
    let template = init_state::<TestBackend>(&config, &device);
    let restored = match checkpointer.load(&template, &device) {
        LoadOutcome::Loaded(restored) => restored,
        other => panic!("expected a checkpoint, got {:?}", other.map(|state| state.step)),
    };

    assert_eq!(restored.step, 42);
    assert_eq!(restored.counters, state.counters);
    assert_same(
        &parameter_values(&restored.generator),
        &parameter_values(&state.generator),
    );
    assert_same(
        &parameter_values(&restored.discriminator),
        &parameter_values(&state.discriminator),
    );
    assert_same(
        &parameter_values(&restored.averaged_generator),
        &parameter_values(&state.averaged_generator),
    );
}

#[test]
fn trained_optimizer_state_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path()).with_epoch(1).with_iteration(1);
    let paths = config.run_paths();
    let loader = random_loader(&device);
    let mut source = LoaderSource::new(loader.as_ref());

    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = biggan::model::training::Trainer::new(config.clone(), state, device.clone())
        .unwrap();
    trainer.resume().unwrap();
    trainer.fit(&mut source).unwrap();
    let trained = trainer.into_state();

    let template = init_state::<TestBackend>(&config, &device);
    let restored = match Checkpointer::new(paths.checkpoints, 5).load(&template, &device) {
        LoadOutcome::Loaded(restored) => restored,
        other => panic!("expected a checkpoint, got {:?}", other.map(|state| state.step)),
    };
    assert_eq!(restored.step, 1);
    assert_same(
        &parameter_values(&restored.generator),
        &parameter_values(&trained.generator),
    );

    // Adam moments decide the next step, so equal results need equal state.
    let after_trained = adam_step(trained);
    let after_restored = adam_step(restored);
    assert_same(&after_restored.0, &after_trained.0);
    assert_same(&after_restored.1, &after_trained.1);
}

/// One optimizer step per network on a loss that depends only on the weights.
fn adam_step<OG, OD>(state: TrainingState<TestBackend, OG, OD>) -> (Vec<Vec<f32>>, Vec<Vec<f32>>)
where
    OG: Optimizer<Generator<TestBackend>, TestBackend>,
    OD: Optimizer<Discriminator<TestBackend>, TestBackend>,
{
    let TrainingState {
        generator,
        discriminator,
        mut optimizer_g,
        mut optimizer_d,
        ..
    } = state;

    let grads = generator.orthogonal_penalty(1.0).backward();
    let grads = GradientsParams::from_grads(grads, &generator);
    let generator = optimizer_g.step(1e-3, generator, grads);

    let grads = discriminator.orthogonal_penalty(1.0).backward();
    let grads = GradientsParams::from_grads(grads, &discriminator);
    let discriminator = optimizer_d.step(1e-3, discriminator, grads);

    (parameter_values(&generator), parameter_values(&discriminator))
}

#[test]
fn keeps_only_the_newest_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path());
    let checkpointer = Checkpointer::new(dir.path().join("ckpt"), 2);

    let mut state = init_state::<TestBackend>(&config, &device);
    for step in [10, 20, 30] {
        state.step = step;
        checkpointer.save(&state).unwrap();
    }

    let mut kept: Vec<String> = std::fs::read_dir(checkpointer.dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("step-"))
        .collect();
    kept.sort();
    assert_eq!(kept, ["step-00000020", "step-00000030"]);

    let template = init_state::<TestBackend>(&config, &device);
    match checkpointer.load(&template, &device) {
        LoadOutcome::Loaded(restored) => assert_eq!(restored.step, 30),
        other => panic!("expected a checkpoint, got {:?}", other.map(|state| state.step)),
    }
}

#[cfg(unix)]
#[test]
fn undeletable_old_checkpoint_does_not_fail_the_save() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path());
    let checkpointer = Checkpointer::new(dir.path().join("ckpt"), 1);

    let mut state = init_state::<TestBackend>(&config, &device);
    state.step = 10;
    let stale = checkpointer.save(&state).unwrap();
    // A read-only subdirectory with content blocks removal for non-root users.
    let locked = stale.join("locked");
    std::fs::create_dir(&locked).unwrap();
    std::fs::write(locked.join("pinned"), b"x").unwrap();
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

    state.step = 20;
    let saved = checkpointer.save(&state);
    if locked.exists() {
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
    }
    assert!(saved.unwrap().ends_with("step-00000020"));

    let template = init_state::<TestBackend>(&config, &device);
    match checkpointer.load(&template, &device) {
        LoadOutcome::Loaded(restored) => assert_eq!(restored.step, 20),
        other => panic!("expected a checkpoint, got {:?}", other.map(|state| state.step)),
    }
}

#[test]
fn garbage_manifest_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path());
    let ckpt = dir.path().join("ckpt");
    std::fs::create_dir_all(&ckpt).unwrap();
    std::fs::write(ckpt.join("checkpoint.json"), "{ definitely not a manifest").unwrap();

    let template = init_state::<TestBackend>(&config, &device);
    let outcome = Checkpointer::new(ckpt, 5).load(&template, &device);
    assert!(matches!(outcome, LoadOutcome::Corrupt(_)));
}

#[test]
fn missing_record_files_are_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path());
    let checkpointer = Checkpointer::new(dir.path().join("ckpt"), 5);

    let state = init_state::<TestBackend>(&config, &device);
    let written = checkpointer.save(&state).unwrap();
    std::fs::remove_file(written.join("discriminator.mpk")).unwrap();

    let outcome = checkpointer.load(&state, &device);
    match outcome {
        LoadOutcome::Corrupt(reason) => assert!(reason.contains("discriminator")),
        other => panic!("expected corruption, got {:?}", other.map(|state| state.step)),
    }
}
