// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/remap.rs - 感兴趣区域偏移与边界钳制
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use super::Detection;
use crate::geometry::{Keypoint, Rect};

/// 关键点越界时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypointPolicy {
  /// 钳制到图像范围内并保留
  Clamp,
  /// 任一关键点越界则丢弃整个检测
  RequireInside,
}

/// 将 NMS 保留的候选从区域坐标平移回整幅图像坐标
///
/// 框与图像求交，面积为 0 的候选被丢弃；关键点按 `policy` 处理。
pub fn remap(
  candidates: &[Detection],
  indices: &[usize],
  roi: &Rect,
  image_width: u32,
  image_height: u32,
  policy: KeypointPolicy,
) -> Vec<Detection> {
  let image_bound = Rect::from_size(image_width, image_height);
  let max_x = image_width as i32 - 1;
  let max_y = image_height as i32 - 1;

  let mut results = Vec::with_capacity(indices.len());
  'candidates: for &idx in indices {
    let Some(candidate) = candidates.get(idx) else {
      continue;
    };

    let bbox = candidate.bbox.translate(roi.x, roi.y).intersect(&image_bound);
    if bbox.is_empty() {
      continue;
    }

    let keypoints = match candidate.keypoints {
      Some(keypoints) => {
        let mut moved = [Keypoint::new(0, 0, 0.0); 4];
        for (dst, src) in moved.iter_mut().zip(keypoints.iter()) {
          let keypoint = src.translate(roi.x, roi.y);
          *dst = match policy {
            KeypointPolicy::Clamp => Keypoint::new(
              keypoint.x.clamp(0, max_x),
              keypoint.y.clamp(0, max_y),
              keypoint.score,
            ),
            KeypointPolicy::RequireInside => {
              if !image_bound.contains(keypoint.x, keypoint.y) {
                continue 'candidates;
              }
              keypoint
            }
          };
        }
        Some(moved)
      }
      None => None,
    };

    results.push(Detection {
      bbox,
      keypoints,
      ..candidate.clone()
    });
  }

  results
}

#[cfg(test)]
mod tests {
  use super::*;

  fn plate(bbox: Rect, corners: [(i32, i32); 4]) -> Detection {
    Detection {
      class_id: 1,
      confidence: 0.9,
      bbox,
      keypoints: Some(corners.map(|(x, y)| Keypoint::new(x, y, 0.8))),
      ..Detection::default()
    }
  }

  #[test]
  fn test_offsets_by_roi_origin() {
    let candidates = [plate(
      Rect::new(10, 20, 30, 10),
      [(10, 20), (10, 29), (39, 29), (39, 20)],
    )];
    let roi = Rect::new(100, 50, 200, 200);
    let out = remap(&candidates, &[0], &roi, 640, 480, KeypointPolicy::Clamp);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].bbox, Rect::new(110, 70, 30, 10));
    let keypoints = out[0].keypoints.unwrap();
    assert_eq!((keypoints[2].x, keypoints[2].y), (139, 79));
    assert_eq!(keypoints[2].score, 0.8);
  }

  #[test]
  fn test_clamp_policy_keeps_border_keypoints() {
    let candidates = [plate(
      Rect::new(600, 450, 60, 40),
      [(600, 450), (600, 489), (659, 489), (659, 450)],
    )];
    let roi = Rect::new(0, 0, 640, 480);
    let out = remap(&candidates, &[0], &roi, 640, 480, KeypointPolicy::Clamp);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].bbox, Rect::new(600, 450, 40, 30));
    let keypoints = out[0].keypoints.unwrap();
    assert_eq!((keypoints[2].x, keypoints[2].y), (639, 479));
  }

  #[test]
  fn test_require_inside_policy_drops_detection() {
    let candidates = [plate(
      Rect::new(600, 450, 60, 40),
      [(600, 450), (600, 489), (659, 489), (659, 450)],
    )];
    let roi = Rect::new(0, 0, 640, 480);
    let out = remap(
      &candidates,
      &[0],
      &roi,
      640,
      480,
      KeypointPolicy::RequireInside,
    );
    assert!(out.is_empty());
  }

  #[test]
  fn test_box_outside_image_is_dropped() {
    let candidates = [plate(
      Rect::new(50, 0, 10, 10),
      [(50, 0), (50, 9), (59, 9), (59, 0)],
    )];
    let roi = Rect::new(600, 0, 100, 100);
    let out = remap(&candidates, &[0], &roi, 640, 480, KeypointPolicy::Clamp);
    assert!(out.is_empty());
  }

  #[test]
  fn test_only_selected_indices() {
    let candidates = [
      plate(Rect::new(0, 0, 10, 10), [(0, 0), (0, 9), (9, 9), (9, 0)]),
      plate(Rect::new(20, 0, 10, 10), [(20, 0), (20, 9), (29, 9), (29, 0)]),
    ];
    let roi = Rect::from_size(640, 480);
    let out = remap(&candidates, &[1], &roi, 640, 480, KeypointPolicy::RequireInside);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].bbox.x, 20);
  }
}
