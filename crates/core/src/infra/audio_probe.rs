use std::fs::File;
use std::path::Path;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

/// 音声ファイルの長さ計測（同期ブラックボックス）
pub trait DurationProbe: Send + Sync {
    /// 秒数。計測できない場合は None。
    fn probe_seconds(&self, path: &Path) -> Option<f64>;

    fn name(&self) -> &str;
}

/// Symphonia でコンテナを解析して長さを求める。
pub struct SymphoniaDurationProbe;

impl DurationProbe for SymphoniaDurationProbe {
    fn probe_seconds(&self, path: &Path) -> Option<f64> {
        match measure(path) {
            Ok(secs) if secs.is_finite() && secs > 0.0 => Some(secs),
            Ok(secs) => {
                log::warn!("音声長が不正です ({secs}): {path:?}");
                None
            }
            Err(e) => {
                log::warn!("音声長の取得に失敗: {path:?}: {e}");
                None
            }
        }
    }

    fn name(&self) -> &str {
        "symphonia"
    }
}

fn measure(path: &Path) -> Result<f64, String> {
    let file = File::open(path).map_err(|e| format!("open failed: {e}"))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| format!("unsupported format: {e}"))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| "No audio track found".to_string())?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate) {
        if rate > 0 {
            return Ok(frames as f64 / rate as f64);
        }
    }

    // ヘッダにフレーム数が無い（VBR mp3 等）場合はパケット長を積算する
    let time_base = params
        .time_base
        .or_else(|| params.sample_rate.map(|r| TimeBase::new(1, r)))
        .ok_or_else(|| "Unknown time base".to_string())?;

    let mut total: u64 = 0;
    loop {
        match format.next_packet() {
            Ok(packet) => {
                if packet.track_id() == track_id {
                    total += packet.dur;
                }
            }
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(e) => return Err(format!("packet read failed: {e}")),
        }
    }

    let time = time_base.calc_time(total);
    Ok(time.seconds as f64 + time.frac)
}
