mod common;

use biggan::GanError;
use biggan::logging::LossLog;
use biggan::model::{
    checkpoint::Checkpointer,
    loss::GanType,
    training::{self, Stage, Trainer, UpdateCounters, init_state},
};
use biggan::model::data::LoaderSource;
use burn::prelude::*;
use common::{TestBackend, loader_over, random_loader, tiny_config};

#[test]
fn critic_updates_follow_n_critic() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path())
        .with_epoch(1)
        .with_iteration(9)
        .with_n_critic(3);
    let loader = random_loader(&device);
    let mut source = LoaderSource::new(loader.as_ref());

    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = Trainer::new(config, state, device).unwrap();
    trainer.resume().unwrap();
    trainer.fit(&mut source).unwrap();

    let state = trainer.state();
    assert_eq!(state.step, 9);
    assert_eq!(
        state.counters,
        UpdateCounters {
            discriminator_updates: 27,
            generator_updates: 9,
            average_updates: 9,
        }
    );
}

#[test]
fn resumes_from_saved_step() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path())
        .with_epoch(1)
        .with_iteration(510)
        .with_n_critic(1);
    let paths = config.run_paths();

    let mut saved = init_state::<TestBackend>(&config, &device);
    saved.step = 500;
    saved.counters = UpdateCounters {
        discriminator_updates: 500,
        generator_updates: 500,
        average_updates: 500,
    };
    Checkpointer::new(paths.checkpoints.clone(), 5)
        .save(&saved)
        .unwrap();

    let loader = random_loader(&device);
    let mut source = LoaderSource::new(loader.as_ref());
    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = Trainer::new(config, state, device).unwrap();
    trainer.resume().unwrap();
    assert_eq!(trainer.state().step, 500);

    trainer.fit(&mut source).unwrap();
    assert_eq!(trainer.stage(), Stage::Finished);
    let state = trainer.into_state();
    assert_eq!(state.step, 510);
    assert_eq!(state.counters.generator_updates, 510);
    assert_eq!(state.counters.discriminator_updates, 510);
    assert_eq!(state.counters.average_updates, 510);
}

#[test]
fn writes_loss_log_and_sample_grids() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path())
        .with_gan_type(GanType::WganGp)
        .with_epoch(2)
        .with_iteration(2)
        .with_n_critic(1)
        .with_print_freq(1);
    let paths = config.run_paths();
    let loader = random_loader(&device);
    let mut source = LoaderSource::new(loader.as_ref());

    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = Trainer::new(config, state, device).unwrap();
    trainer.resume().unwrap();
    trainer.fit(&mut source).unwrap();

    let records = LossLog::new(paths.logs.join("losses.jsonl"))
        .read_all()
        .unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records.iter().map(|r| r.step).collect::<Vec<_>>(), [1, 2, 3, 4]);
    assert!(records.iter().all(|r| r.d_loss.is_finite() && r.g_loss.is_finite()));

    assert!(paths.samples.join("BigGAN_train_00_00001.png").exists());
    assert!(paths.samples.join("BigGAN_train_01_00002.png").exists());
    assert!(paths.results.join("BigGAN_epoch000_visualize.png").exists());
    assert!(paths.results.join("BigGAN_epoch001_visualize.png").exists());
}

#[test]
fn non_finite_loss_stops_before_any_update() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path())
        .with_gan_type(GanType::Lsgan)
        .with_epoch(1)
        .with_iteration(3);
    let paths = config.run_paths();
    let loader = loader_over(Tensor::full([4, 1, 128, 128], f32::NAN, &device));
    let mut source = LoaderSource::new(loader.as_ref());

    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = Trainer::new(config, state, device).unwrap();
    trainer.resume().unwrap();
    let err = trainer.fit(&mut source).unwrap_err();
    assert!(matches!(
        err,
        GanError::NumericDivergence {
            network: "discriminator",
            step: 0,
            ..
        }
    ));

    let state = trainer.state();
    assert_eq!(state.step, 0);
    assert_eq!(state.counters, UpdateCounters::default());
    assert!(!paths.checkpoints.join("checkpoint.json").exists());
}

#[test]
fn corrupt_checkpoint_aborts_unless_opted_out() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path()).with_epoch(1).with_iteration(1);
    let paths = config.run_paths();
    std::fs::create_dir_all(&paths.checkpoints).unwrap();
    std::fs::write(paths.checkpoints.join("checkpoint.json"), "not json").unwrap();

    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = Trainer::new(config.clone(), state, device.clone()).unwrap();
    let err = trainer.resume().unwrap_err();
    assert!(matches!(err, GanError::CheckpointCorrupt(_)));

    let config = config.with_fresh_on_corrupt(true);
    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = Trainer::new(config, state, device).unwrap();
    trainer.resume().unwrap();
    assert_eq!(trainer.state().step, 0);
}

#[test]
fn test_phase_needs_a_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let err = training::test::<TestBackend>(config, Default::default()).unwrap_err();
    assert!(matches!(err, GanError::NoCheckpoint(_)));
}

#[test]
fn test_phase_writes_requested_images() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path()).with_epoch(1).with_iteration(1);
    let loader = random_loader(&device);
    let mut source = LoaderSource::new(loader.as_ref());

    let state = init_state::<TestBackend>(&config, &device);
    let mut trainer = Trainer::new(config.clone(), state, device.clone()).unwrap();
    trainer.resume().unwrap();
    trainer.fit(&mut source).unwrap();

    let written = training::test::<TestBackend>(config, device).unwrap();
    assert_eq!(written.len(), 2);
    assert!(written.iter().all(|path| path.exists()));
    assert!(written[1].ends_with("BigGAN_test_1.png"));
}
