// End-to-end tests running the proportion test from per-cell annotations or counts.

#[cfg(test)]
mod integration_tests {
    use approx::assert_relative_eq;
    use nalgebra_sparse::{CooMatrix, CsrMatrix};
    use ndarray::array;
    use single_propeller::data::{CellAnnotations, CountMatrix, SampleConditions};
    use single_propeller::propeller::{propeller, propeller_counts, PropellerConfig};
    use single_propeller::testing::TestMode;
    use single_propeller::transform::Transform;
    use single_propeller::PropellerError;

    /// Expand per-sample cluster counts into one annotation per cell.
    fn cells_from_counts<const K: usize>(
        samples: &[(&str, &str, [usize; K])],
        clusters: [&str; K],
    ) -> CellAnnotations {
        let mut sample_col = Vec::new();
        let mut condition_col = Vec::new();
        let mut cluster_col = Vec::new();
        for (sample, condition, counts) in samples {
            for (cluster, &n) in clusters.iter().zip(counts.iter()) {
                for _ in 0..n {
                    sample_col.push(sample.to_string());
                    condition_col.push(condition.to_string());
                    cluster_col.push(cluster.to_string());
                }
            }
        }
        CellAnnotations::new(sample_col, condition_col, cluster_col).unwrap()
    }

    fn input_error(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<PropellerError>(),
            Some(PropellerError::Input(_))
        )
    }

    #[test]
    fn test_two_condition_t_test_from_cells() {
        let cells = cells_from_counts(
            &[
                ("s1", "ctrl", [20, 60, 150, 270]),
                ("s2", "ctrl", [26, 52, 140, 282]),
                ("s3", "ctrl", [18, 70, 165, 247]),
                ("s4", "stim", [48, 55, 145, 252]),
                ("s5", "stim", [55, 48, 155, 242]),
                ("s6", "stim", [44, 63, 135, 258]),
            ],
            ["T", "B", "NK", "Mono"],
        );
        let out = propeller(&cells, &PropellerConfig::default()).unwrap();

        assert!(!out.simulated);
        assert_eq!(out.results.mode(), TestMode::TTest);
        assert_eq!(out.results.categories(), ["T", "B", "NK", "Mono"]);
        assert_eq!(
            out.results.column_names(),
            [
                "Baseline_props",
                "Mean_props_ctrl",
                "Mean_props_stim",
                "Prop_ratio",
                "t_statistics",
                "p_values",
                "Adjusted_p_values"
            ]
        );

        let t_row = out.results.row("T").unwrap();
        assert_relative_eq!(t_row.baseline_prop, 211.0 / 3000.0, epsilon = 1e-12);
        assert!(t_row.statistic < 0.0, "T rises under stim, so ctrl - stim is negative");
        assert_eq!(out.results.top_categories(1), vec!["T"]);
        assert!(out.results.significant(0.05).contains(&"T"));

        for (p, q) in out.results.p_values().iter().zip(out.results.adjusted_p_values()) {
            assert!((0.0..=1.0).contains(p));
            assert!(q >= p);
        }
    }

    #[test]
    fn test_anova_for_three_conditions() {
        let cells = cells_from_counts(
            &[
                ("a1", "A", [30, 90, 180, 200]),
                ("a2", "A", [36, 84, 170, 210]),
                ("a3", "A", [27, 95, 190, 188]),
                ("b1", "B", [60, 85, 175, 180]),
                ("b2", "B", [66, 80, 160, 194]),
                ("b3", "B", [57, 92, 170, 181]),
                ("c1", "C", [31, 140, 150, 179]),
                ("c2", "C", [35, 150, 140, 175]),
                ("c3", "C", [28, 135, 160, 177]),
            ],
            ["k1", "k2", "k3", "k4"],
        );
        let out = propeller(&cells, &PropellerConfig::default()).unwrap();

        let results = &out.results;
        assert_eq!(results.mode(), TestMode::Anova);
        assert_eq!(results.df_numerator(), Some(2));
        assert_eq!(results.statistics().len(), 4);
        assert_eq!(results.p_values().len(), 4);
        assert!(results.prop_ratio().is_none());
        assert!(results.column("F_statistics").is_some());
        assert!(results.column("t_statistics").is_none());
        assert_eq!(results.conditions(), ["A", "B", "C"]);
        assert!(results.statistics().iter().all(|f| *f >= 0.0));

        let moderated = out.moderated.as_ref().unwrap();
        assert_eq!(moderated.df_numerator, Some(2));
        assert_eq!(out.design.columns()[0], "A");
    }

    #[test]
    fn test_unreplicated_data_is_simulated() {
        let counts = CountMatrix::new(
            vec!["ctrl".into(), "stim".into()],
            vec!["c1".into(), "c2".into(), "c3".into(), "c4".into(), "c5".into()],
            array![[15.0, 49.0, 162.0, 386.0, 388.0], [10.0, 62.0, 172.0, 288.0, 468.0]],
        )
        .unwrap();
        let sheet = SampleConditions::new(["ctrl", "stim"], ["ctrl", "stim"]).unwrap();
        let config = PropellerConfig::default()
            .with_n_sims(50)
            .with_n_reps(6)
            .with_seed(10);

        let out = propeller_counts(&counts, &sheet, &config).unwrap();

        assert!(out.simulated);
        assert!(out.n_attempts >= 50);
        assert_eq!(out.transform, Transform::Arcsin);
        assert_eq!(out.results.categories(), counts.categories());
        for p in out
            .results
            .p_values()
            .iter()
            .chain(out.results.adjusted_p_values())
        {
            assert!((0.0..=1.0).contains(p));
        }

        // pooled means stay close to the observed proportions
        let ctrl = out.results.mean_props_of("ctrl").unwrap();
        assert_relative_eq!(ctrl[3], 0.386, epsilon = 0.02);
        assert_relative_eq!(out.results.baseline_props()[0], 25.0 / 2000.0, epsilon = 1e-12);

        assert_eq!(out.counts.n_samples(), 12);
        assert_eq!(out.counts.samples()[0], "ctrl_rep_1");
        assert_eq!(out.props.dim(), (12, 5));
    }

    #[test]
    fn test_single_condition_fails_before_computation() {
        let cells = cells_from_counts(
            &[("s1", "ctrl", [5, 10]), ("s2", "ctrl", [7, 9])],
            ["x", "y"],
        );
        let err = propeller(&cells, &PropellerConfig::default()).unwrap_err();
        assert!(input_error(&err));
    }

    #[test]
    fn test_conflicting_condition_is_rejected() {
        let cells = CellAnnotations::new(
            ["s1", "s1", "s2"],
            ["ctrl", "stim", "stim"],
            ["x", "y", "x"],
        )
        .unwrap();
        let err = propeller(&cells, &PropellerConfig::default()).unwrap_err();
        assert!(input_error(&err));
    }

    #[test]
    fn test_missing_sample_condition() {
        let counts = CountMatrix::new(
            vec!["s1".into(), "s2".into(), "s3".into()],
            vec!["x".into(), "y".into()],
            array![[5.0, 5.0], [3.0, 7.0], [6.0, 4.0]],
        )
        .unwrap();
        let sheet = SampleConditions::new(["s1", "s2"], ["ctrl", "stim"]).unwrap();
        let err = propeller_counts(&counts, &sheet, &PropellerConfig::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PropellerError>(),
            Some(&PropellerError::SampleMismatch {
                sample: "s3".into()
            })
        );
    }

    #[test]
    fn test_confounder_keeps_t_test_on_conditions() {
        let counts = CountMatrix::new(
            (1..=8).map(|i| format!("s{}", i)).collect(),
            vec!["x".into(), "y".into(), "z".into()],
            array![
                [20.0, 30.0, 50.0],
                [22.0, 33.0, 45.0],
                [18.0, 28.0, 54.0],
                [25.0, 31.0, 44.0],
                [40.0, 29.0, 31.0],
                [43.0, 27.0, 30.0],
                [38.0, 35.0, 27.0],
                [45.0, 26.0, 29.0]
            ],
        )
        .unwrap();
        let samples: Vec<String> = (1..=8).map(|i| format!("s{}", i)).collect();
        let sheet = SampleConditions::new(
            samples.clone(),
            ["ctrl", "ctrl", "ctrl", "ctrl", "stim", "stim", "stim", "stim"],
        )
        .unwrap()
        .with_confounder("batch", samples, ["b1", "b2", "b1", "b2", "b1", "b2", "b1", "b2"])
        .unwrap();

        let config = PropellerConfig::default().with_transform(Transform::Arcsin);
        let out = propeller_counts(&counts, &sheet, &config).unwrap();

        assert_eq!(out.design.columns(), ["ctrl", "stim", "batch_b2"]);
        assert_eq!(out.results.mode(), TestMode::TTest);
        assert_eq!(out.results.conditions(), ["ctrl", "stim"]);
        assert_eq!(out.results.top_categories(1), vec!["x"]);
    }

    #[test]
    fn test_sparse_counts_match_dense() {
        let mut coo = CooMatrix::new(4, 3);
        let dense = array![
            [10.0, 0.0, 30.0],
            [12.0, 3.0, 25.0],
            [0.0, 20.0, 20.0],
            [2.0, 24.0, 14.0]
        ];
        for ((i, j), &v) in dense.indexed_iter() {
            if v > 0.0 {
                coo.push(i, j, v);
            }
        }
        let csr = CsrMatrix::from(&coo);
        let samples: Vec<String> = ["s1", "s2", "s3", "s4"].iter().map(|s| s.to_string()).collect();
        let categories: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();

        let sparse = CountMatrix::from_sparse(&csr, samples.clone(), categories.clone()).unwrap();
        let expected = CountMatrix::new(samples, categories, dense).unwrap();
        assert_eq!(sparse, expected);
    }

    #[test]
    fn test_identical_replicates_fail_moment_matching() {
        let counts = CountMatrix::new(
            vec!["s1".into(), "s2".into(), "s3".into(), "s4".into()],
            vec!["x".into(), "y".into(), "z".into()],
            array![
                [10.0, 20.0, 70.0],
                [10.0, 20.0, 70.0],
                [30.0, 20.0, 50.0],
                [30.0, 20.0, 50.0]
            ],
        )
        .unwrap();
        let sheet =
            SampleConditions::new(["s1", "s2", "s3", "s4"], ["ctrl", "ctrl", "stim", "stim"])
                .unwrap();

        let err = propeller_counts(&counts, &sheet, &PropellerConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PropellerError>(),
            Some(PropellerError::RootFinding(_))
        ));
    }

    #[test]
    fn test_unreplicated_degenerate_counts_exhaust_the_simulation() {
        let counts = CountMatrix::new(
            vec!["ctrl".into(), "stim".into()],
            vec!["x".into(), "y".into(), "z".into()],
            array![[100.0, 0.0, 0.0], [50.0, 0.0, 0.0]],
        )
        .unwrap();
        let sheet = SampleConditions::new(["ctrl", "stim"], ["ctrl", "stim"]).unwrap();
        let config = PropellerConfig::default().with_n_sims(1).with_seed(7);

        let err = propeller_counts(&counts, &sheet, &config).unwrap_err();
        match err.downcast_ref::<PropellerError>() {
            Some(PropellerError::SimulationExhausted {
                run,
                attempts,
                reason,
            }) => {
                assert_eq!((*run, *attempts), (0, 10));
                assert!(reason.starts_with("Root finding failed"));
            }
            other => panic!("expected an exhausted simulation, got {:?}", other),
        }
    }

    #[test]
    fn test_fractional_counts_are_rejected() {
        let result = CountMatrix::new(
            vec!["s1".into(), "s2".into()],
            vec!["x".into(), "y".into(), "z".into()],
            array![[0.2, 0.3, 0.1], [0.25, 0.25, 0.2]],
        );
        assert!(input_error(&result.unwrap_err()));
    }
}
