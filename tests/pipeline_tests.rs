//! End-to-end sampling pipeline tests
//!
//! Everything runs on the CPU with a tiny hand-written embedding table and
//! closure denoisers, so no checkpoint download is needed.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use embdiff_rs::config::{GuidanceMode, NoiseSchedule, SamplingMode};
use embdiff_rs::decoding::{TokenDecoder, Vocabulary};
use embdiff_rs::diffusion::{GuidanceFunction, NoiseSource, RoundingGuidance};
use embdiff_rs::engine::{EMBEDDINGS_FILE, VOCAB_FILE};
use embdiff_rs::weights::{
    load_sample_corpus, save_sample_corpus, LM_HEAD_BIAS_KEY, LM_HEAD_WEIGHT_KEY,
};
use embdiff_rs::{EmbeddingTable, Result, RunConfig, SampleError, SamplingPipeline, SingleProcess};

const TOKENS: [&str; 5] = ["the", "cat", "sat", "dog", "ran"];

/// Five well separated rows in 4 dims
fn table() -> Result<EmbeddingTable> {
    EmbeddingTable::new(Tensor::new(
        &[
            [1f32, 0., 0., 0.],
            [0., 1., 0., 0.],
            [0., 0., 1., 0.],
            [0., 0., 0., 1.],
            [-1., -1., -1., -1.],
        ],
        &Device::Cpu,
    )?)
}

fn vocab() -> Vocabulary {
    Vocabulary::from_tokens(TOKENS)
}

fn write_reference(dir: &Path, lines: &[String]) -> Result<std::path::PathBuf> {
    let path = dir.join("reference.txt");
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(&path, content)?;
    Ok(path)
}

fn base_config(dir: &Path) -> RunConfig {
    RunConfig {
        batch_size: 2,
        num_samples: 2,
        candidates_per_sample: 1,
        diffusion_steps: 0,
        sequence_len: 5,
        in_channel: 4,
        top_p: 1.0,
        clamp: GuidanceMode::Clamp,
        sampling: SamplingMode::Ancestral,
        clip_denoised: false,
        rescale_timesteps: true,
        noise_schedule: NoiseSchedule::Sqrt,
        predict_xstart: true,
        out_dir: dir.join("generation_outputs"),
        model_name_or_path: dir.join("diff_e2e").join("ema_0.9999_200000.pt"),
        seed: 101,
        sanity_reference: None,
    }
}

/// Denoiser that always predicts the embeddings of "the cat sat"
fn the_cat_sat(
    table: &EmbeddingTable,
) -> Result<impl Fn(&Tensor, &Tensor, Option<&Tensor>) -> candle_core::Result<Tensor> + Sync> {
    let target = table.encode(&[vec![0, 1, 2]])?;
    Ok(move |x: &Tensor, _t: &Tensor, _c: Option<&Tensor>| -> candle_core::Result<Tensor> {
        target.broadcast_as(x.shape())?.contiguous()
    })
}

#[test]
fn test_zero_steps_decodes_initial_noise() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = base_config(dir.path());

    // The untouched initial noise of rank 0, decoded by hand
    let noise = NoiseSource::for_rank(config.seed, 0).standard_normal((2, 5, 4), &Device::Cpu)?;
    let expected = TokenDecoder::new(vocab(), 5).decode_to_text(&noise, &table()?)?;
    assert_eq!(expected.len(), 2);
    config.sanity_reference = Some(write_reference(dir.path(), &expected)?);

    let pipeline = SamplingPipeline::new(config, table()?, vocab(), Device::Cpu)?;
    let denoiser = |x: &Tensor, _t: &Tensor, _c: Option<&Tensor>| -> candle_core::Result<Tensor> {
        x.zeros_like()
    };
    let outcome = pipeline.run_worker(&denoiser, SingleProcess)?;

    assert_eq!(outcome.lines, expected);
    assert_eq!(outcome.stats.rounds, 1);
    assert_eq!(outcome.stats.dropped, 0);

    let outputs = outcome.outputs.unwrap();
    assert_eq!(
        outputs.text.file_name().unwrap().to_string_lossy(),
        "diff_e2e.ema_0.9999_200000.pt.samples_1.0.steps=0.txt"
    );
    let written = std::fs::read_to_string(&outputs.text)?;
    assert_eq!(written.lines().count(), 2);
    Ok(())
}

#[test]
fn test_embedding_round_trip() -> Result<()> {
    let table = table()?;
    let ids = vec![vec![4u32, 0, 3], vec![2, 2, 1]];
    let sample = table.encode(&ids)?;

    let decoder = TokenDecoder::new(vocab(), 3);
    let decoded = decoder.decode(&sample, &table)?;
    assert_eq!(decoded[0].ids(), &[4, 0, 3]);
    assert_eq!(decoded[1].ids(), &[2, 2, 1]);
    assert_eq!(
        decoder.render(&decoded)?,
        vec![
            vec!["ran".to_string(), "the".into(), "dog".into()],
            vec!["sat".to_string(), "sat".into(), "cat".into()],
        ]
    );
    Ok(())
}

#[test]
fn test_clamped_rows_are_table_rows() -> Result<()> {
    let table = table()?;
    let guidance = RoundingGuidance::new(std::sync::Arc::new(table.clone()));
    let x = Tensor::randn(0f32, 1f32, (3, 4, 4), &Device::Cpu)?;
    let rounded: Vec<Vec<f32>> = guidance.apply(&x, 1)?.reshape((12, 4))?.to_vec2()?;

    let rows: Vec<Vec<f32>> = table.weight().to_vec2()?;
    for row in rounded {
        assert!(rows.contains(&row), "{row:?} is not a table row");
    }
    Ok(())
}

#[test]
fn test_multi_worker_run_passes_sanity_check() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = base_config(dir.path());
    config.batch_size = 2;
    config.num_samples = 5;
    config.sequence_len = 3;
    config.diffusion_steps = 10;
    config.sampling = SamplingMode::Deterministic;
    config.sanity_reference = Some(write_reference(dir.path(), &vec!["the cat sat".to_string(); 5])?);

    let table = table()?;
    let denoiser = the_cat_sat(&table)?;
    let pipeline = SamplingPipeline::new(config, table, vocab(), Device::Cpu)?;
    let outcomes = pipeline.run_local(3, &denoiser)?;

    assert_eq!(outcomes.len(), 3);
    for (rank, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.cluster.rank(), rank);
        assert_eq!(outcome.lines.len(), 5);
        assert!(outcome.lines.iter().all(|l| l == "the cat sat"));
        // 3 workers x 2 samples in one round, one dropped from the tail
        assert_eq!(outcome.stats.gathered, 6);
        assert_eq!(outcome.stats.dropped, 1);
        assert_eq!(outcome.outputs.is_some(), rank == 0);
        assert_eq!(outcome.report.min_similarity, 1.0);
    }
    Ok(())
}

#[test]
fn test_multi_worker_run_fails_sanity_check() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = base_config(dir.path());
    config.num_samples = 2;
    config.sequence_len = 3;
    config.diffusion_steps = 4;
    config.sampling = SamplingMode::Deterministic;
    config.sanity_reference = Some(write_reference(
        dir.path(),
        &["the cat sat".to_string(), "the cat sit".to_string()],
    )?);

    let table = table()?;
    let denoiser = the_cat_sat(&table)?;
    let pipeline = SamplingPipeline::new(config, table, vocab(), Device::Cpu)?;

    match pipeline.run_local(2, &denoiser) {
        Err(SampleError::Validation(failure)) => {
            assert_eq!(failure.index, 1);
            assert_eq!(failure.similarity, 0.5);
            assert!(failure.symmetric_difference.contains("sit"));
            assert!(failure.symmetric_difference.contains("sat"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_numerical_failure_aborts_every_worker() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = base_config(dir.path());
    config.diffusion_steps = 3;
    config.sanity_reference = Some(write_reference(dir.path(), &["the".to_string()])?);

    let pipeline = SamplingPipeline::new(config, table()?, vocab(), Device::Cpu)?;
    let denoiser = |x: &Tensor, _t: &Tensor, _c: Option<&Tensor>| -> candle_core::Result<Tensor> {
        x.affine(0.0, f64::NAN)
    };

    match pipeline.run_local(2, &denoiser) {
        Err(SampleError::Numerical { step, .. }) => assert_eq!(step, 3),
        other => panic!("expected numerical error, got {other:?}"),
    }
    // Nothing was written
    assert!(!dir.path().join("generation_outputs").exists());
    Ok(())
}

#[test]
fn test_missing_reference_is_a_configuration_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let res = SamplingPipeline::new(base_config(dir.path()), table()?, vocab(), Device::Cpu);
    assert!(matches!(res, Err(SampleError::Configuration(_))));
    Ok(())
}

#[test]
fn test_saved_corpus_decodes_like_live_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = base_config(dir.path());
    config.sequence_len = 3;
    config.sanity_reference = Some(write_reference(dir.path(), &vec!["the cat sat".to_string(); 2])?);

    let table = table()?;
    let corpus = table
        .encode(&[vec![0, 1, 2], vec![0, 1, 2]])?
        .to_dtype(DType::F32)?;
    let path = dir.path().join("samples.safetensors");
    save_sample_corpus(&corpus, &path)?;

    let pipeline = SamplingPipeline::new(config, table, vocab(), Device::Cpu)?;
    let loaded = load_sample_corpus(&path, None, &Device::Cpu)?;
    let (lines, outputs, report) = pipeline.finish_corpus(&loaded, true)?;

    assert_eq!(lines, vec!["the cat sat".to_string(); 2]);
    assert!(outputs.is_some());
    assert_eq!(report.lines_checked, 2);
    Ok(())
}

#[test]
fn test_checkpoint_head_drives_decoding() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let checkpoint = dir.path().join("diff_e2e");
    std::fs::create_dir_all(&checkpoint)?;

    // Embedding distance picks "a" for [1, 0]; the biased head picks "b"
    let embedding = Tensor::new(&[[1f32, 0.], [0., 1.]], &Device::Cpu)?;
    let tensors: HashMap<String, Tensor> = [
        ("word_embedding.weight".to_string(), embedding.clone()),
        (LM_HEAD_WEIGHT_KEY.to_string(), embedding),
        (LM_HEAD_BIAS_KEY.to_string(), Tensor::new(&[0f32, 5.], &Device::Cpu)?),
    ]
    .into();
    candle_core::safetensors::save(&tensors, checkpoint.join(EMBEDDINGS_FILE))?;
    std::fs::write(checkpoint.join(VOCAB_FILE), r#"{"a": 0, "b": 1}"#)?;

    let mut config = base_config(dir.path());
    config.sequence_len = 2;
    config.in_channel = 2;
    config.model_name_or_path = checkpoint.join("model.pt");
    config.sanity_reference = Some(write_reference(dir.path(), &["b b".to_string()])?);

    let pipeline = SamplingPipeline::from_pretrained(config, &checkpoint)?;
    assert!(pipeline.has_head());

    let corpus = Tensor::new(&[[[1f32, 0.], [1., 0.]]], pipeline.device())?;
    let (lines, _, report) = pipeline.finish_corpus(&corpus, false)?;
    assert_eq!(lines, vec!["b b".to_string()]);
    assert_eq!(report.min_similarity, 1.0);

    let by_distance = TokenDecoder::new(Vocabulary::from_tokens(["a", "b"]), 2)
        .decode_to_text(&corpus, pipeline.table())?;
    assert_eq!(by_distance, vec!["a a".to_string()]);
    Ok(())
}
