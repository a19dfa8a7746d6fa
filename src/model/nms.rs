// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

/// 非极大值抑制，返回保留候选的下标（按置信度降序）
///
/// 算法:
/// 1. 丢弃置信度不高于 `score_threshold` 的候选
/// 2. 按置信度降序稳定排序，置信度相同保持解码顺序
/// 3. 依次保留与所有已保留框 IoU 不超过 `iou_threshold` 的候选
pub fn nms(candidates: &[Detection], score_threshold: f32, iou_threshold: f32) -> Vec<usize> {
  let mut order: Vec<usize> = (0..candidates.len())
    .filter(|&idx| candidates[idx].confidence > score_threshold)
    .collect();
  order.sort_by(|&a, &b| {
    candidates[b]
      .confidence
      .total_cmp(&candidates[a].confidence)
  });

  let mut kept: Vec<usize> = Vec::with_capacity(order.len());
  for idx in order {
    let bbox = &candidates[idx].bbox;
    if kept
      .iter()
      .all(|&k| candidates[k].bbox.iou(bbox) <= iou_threshold)
    {
      kept.push(idx);
    }
  }

  kept
}
