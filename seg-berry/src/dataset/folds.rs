//! 折表: 每行一个样本, 记录其所属的折, 是否为保留测试集, 以及 (可选的) 数据比例分组.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{SegError, SegResult};

/// 折表中的一行.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldRow {
    /// 文件名 (不含目录).
    pub filename: String,

    /// 折号.
    pub fold: usize,

    /// 是否属于保留测试集. csv 中写作 `0/1` 或 `true/false`.
    #[serde(alias = "holdout", deserialize_with = "flag")]
    pub hold_out: bool,

    /// 数据比例分组. `-1` 表示验证集, `0, 1, ...` 为训练子集.
    #[serde(default)]
    pub split: Option<i64>,
}

impl FoldRow {
    /// 非保留测试集的一行.
    pub fn new(filename: impl Into<String>, fold: usize) -> Self {
        Self {
            filename: filename.into(),
            fold,
            hold_out: false,
            split: None,
        }
    }
}

fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let s = String::deserialize(d)?;
    match s.trim() {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!("invalid hold_out flag `{other}`"))),
    }
}

/// 按数据比例划分的训练子集, 以及验证集与测试集.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSplits {
    /// `train[0]` 为完整训练集, 之后依次为各个子集.
    pub train: Vec<Vec<String>>,
    /// 验证集.
    pub val: Vec<String>,
    /// 保留测试集.
    pub test: Vec<String>,
}

/// 折表.
///
/// 构造后不可修改, 可以在线程间共享.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldTable {
    rows: Vec<FoldRow>,
}

impl FoldTable {
    /// 读取 csv 折表. 需要 `filename`, `fold`, `hold_out` (或 `holdout`) 列, `split` 列可选.
    pub fn from_csv(path: impl AsRef<Path>) -> SegResult<Self> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let rows = reader
            .deserialize()
            .collect::<Result<Vec<FoldRow>, csv::Error>>()?;
        let table = Self::from_rows(rows)?;
        log::info!(
            "fold table {}: {} rows, {} folds, {} held out",
            path.as_ref().display(),
            table.rows.len(),
            table.nbof_folds(),
            table.test_set().len()
        );
        Ok(table)
    }

    /// 从内存中的行构造. 空表返回 `Err`.
    pub fn from_rows(rows: Vec<FoldRow>) -> SegResult<Self> {
        if rows.is_empty() {
            return Err(SegError::config("fold table is empty"));
        }
        Ok(Self { rows })
    }

    /// 所有行.
    #[inline]
    pub fn rows(&self) -> &[FoldRow] {
        &self.rows
    }

    #[inline]
    fn kept(&self) -> impl Iterator<Item = &FoldRow> {
        self.rows.iter().filter(|r| !r.hold_out)
    }

    /// 非保留行的折数, 即最大折号加一. 全部保留时为 0.
    pub fn nbof_folds(&self) -> usize {
        self.kept().map(|r| r.fold + 1).max().unwrap_or(0)
    }

    /// 每个折号 `0..nbof_folds` 对应的文件名, 折内保持表中行序.
    ///
    /// 未出现的折号对应空列表.
    pub fn folds(&self) -> Vec<Vec<String>> {
        let mut folds = vec![Vec::new(); self.nbof_folds()];
        for r in self.kept() {
            folds[r.fold].push(r.filename.clone());
        }
        folds
    }

    /// 以 `held_out_fold` 为验证集划分训练集与验证集.
    ///
    /// # 返回值
    ///
    /// `(训练集, 验证集)`; 训练集按折号升序拼接其余各折.
    /// 折号越界时返回 [`SegError::Configuration`].
    pub fn train_test_split(&self, held_out_fold: usize) -> SegResult<(Vec<String>, Vec<String>)> {
        let mut folds = self.folds();
        if held_out_fold >= folds.len() {
            return Err(SegError::config(format!(
                "fold {held_out_fold} out of range, table has {} folds",
                folds.len()
            )));
        }
        let val = folds.remove(held_out_fold);
        Ok((folds.concat(), val))
    }

    /// 保留测试集的文件名.
    pub fn test_set(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|r| r.hold_out)
            .map(|r| r.filename.clone())
            .collect()
    }

    fn split_count(&self) -> SegResult<i64> {
        self.rows
            .iter()
            .filter_map(|r| r.split)
            .max()
            .map(|m| m + 1)
            .filter(|n| *n > 0)
            .ok_or_else(|| SegError::config("fold table has no `split` column"))
    }

    /// 第 0 折之外, 满足 `pred(split)` 的非保留行.
    fn train_where(&self, pred: impl Fn(i64) -> bool) -> Vec<String> {
        self.kept()
            .filter(|r| r.fold != 0 && r.split.map_or(false, &pred))
            .map(|r| r.filename.clone())
            .collect()
    }

    fn val_and_full_train(&self) -> (Vec<String>, Vec<String>) {
        let val = self
            .kept()
            .filter(|r| r.fold == 0 && r.split == Some(-1))
            .map(|r| r.filename.clone())
            .collect();
        let full = self
            .kept()
            .filter(|r| r.fold != 0)
            .map(|r| r.filename.clone())
            .collect();
        (val, full)
    }

    /// 数据比例实验的划分: 各子集互不重叠.
    ///
    /// `train[0]` 为第 0 折之外的全部非保留行, `train[i + 1]` 为 `split == i` 的行;
    /// 验证集为第 0 折中 `split == -1` 的行.
    pub fn splits_train_val_test(&self) -> SegResult<DataSplits> {
        let n = self.split_count()?;
        let (val, full) = self.val_and_full_train();
        let mut train = vec![full];
        train.extend((0..n).map(|i| self.train_where(|s| s == i)));
        Ok(DataSplits {
            train,
            val,
            test: self.test_set(),
        })
    }

    /// 数据比例实验的划分: 小的子集包含在大的子集中.
    ///
    /// `train[i]` 为 `split >= i` 的行, 最后再追加 `split == n - 1` 的行.
    /// 只有当各分组的大小依次减半时, 这些子集才对应 `1, 1/2, 1/4, ...` 的比例.
    pub fn splits_train_val_test_overlapping(&self) -> SegResult<DataSplits> {
        let n = self.split_count()?;
        let (val, _) = self.val_and_full_train();
        let mut train: Vec<Vec<String>> = (0..n).map(|i| self.train_where(|s| s >= i)).collect();
        train.push(self.train_where(|s| s == n - 1));
        Ok(DataSplits {
            train,
            val,
            test: self.test_set(),
        })
    }
}
