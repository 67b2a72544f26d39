use std::fs;
use std::path::Path;

use funit_data::*;
use funit_nn::Rng;
use image::{Luma, Rgb, RgbImage, Rgba, RgbaImage};

fn write_rgb(path: &Path, w: u32, h: u32, color: [u8; 3]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_pixel(w, h, Rgb(color)).save(path).unwrap();
}

fn transform() -> Transform {
    Transform::test(None, 4, 4, 3)
}

#[test]
fn test_image_folder_lists_sorted_classes_and_filters_extensions() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_rgb(&root.join("zebra/b.png"), 4, 4, [10, 20, 30]);
    write_rgb(&root.join("zebra/a.PNG"), 4, 4, [10, 20, 30]);
    write_rgb(&root.join("ant/x.png"), 4, 4, [0, 0, 0]);
    fs::write(root.join("ant/notes.txt"), "not an image").unwrap();
    write_rgb(&root.join("ant/photo.jpg.png"), 4, 4, [0, 0, 0]);
    fs::write(root.join("stray.png"), "top-level files are not classes").unwrap();

    let ds = ImageFolder::new(root, Some(2), Preprocess::default(), transform()).unwrap();
    assert_eq!(ds.class_names(), &["ant".to_string(), "zebra".to_string()]);
    assert_eq!(ds.len(), 4);
    let labels: Vec<usize> = (0..ds.len()).map(|i| ds.label(i)).collect();
    assert_eq!(labels, vec![0, 0, 1, 1]);
    let zebra = list_images(&root.join("zebra")).unwrap();
    assert!(zebra[0].ends_with("zebra/a.PNG"));
}

#[test]
fn test_image_folder_class_count_mismatch_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_rgb(&dir.path().join("only/a.png"), 4, 4, [1, 2, 3]);
    let ds = ImageFolder::new(dir.path(), Some(5), Preprocess::default(), transform()).unwrap();
    assert_eq!(ds.num_classes(), 1);
}

#[test]
fn test_empty_folder_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("empty_class")).unwrap();
    let err = ImageFolder::new(dir.path(), None, Preprocess::default(), transform()).unwrap_err();
    assert!(matches!(err, DataError::Empty(_)));
}

#[test]
fn test_filelist_classes_from_first_component() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_rgb(&root.join("dogs/1.png"), 6, 6, [255, 0, 0]);
    write_rgb(&root.join("cats/sub/2.png"), 6, 6, [0, 255, 0]);
    let list = root.join("list.txt");
    fs::write(&list, "dogs/1.png\n\ncats/sub/2.png\n").unwrap();

    let ds = ImageLabelFilelist::new(root, &list, Preprocess::default(), transform()).unwrap();
    assert_eq!(ds.class_names(), &["cats".to_string(), "dogs".to_string()]);
    assert_eq!(ds.label(0), 1);
    assert_eq!(ds.label(1), 0);

    let sample = ds.get(0, &mut Rng::new(0)).unwrap();
    assert_eq!(sample.image.dims(), &[3, 4, 4]);
    // pure red: R = 1, G = B = -1 after normalisation
    assert!((sample.image.get(&[0, 0, 0]) - 1.0).abs() < 1e-6);
    assert!((sample.image.get(&[1, 0, 0]) + 1.0).abs() < 1e-6);
}

#[test]
fn test_missing_filelist_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ImageLabelFilelist::new(
        dir.path(),
        &dir.path().join("absent.txt"),
        Preprocess::default(),
        transform(),
    )
    .unwrap_err();
    assert!(matches!(err, DataError::Io { .. }));
}

#[test]
fn test_class_rules_grey_invert_and_alpha() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_rgb(&root.join("malaria/cell.png"), 4, 4, [255, 255, 255]);
    fs::create_dir_all(root.join("dp")).unwrap();
    RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]))
        .save(root.join("dp/clear.png"))
        .unwrap();
    fs::create_dir_all(root.join("plain")).unwrap();
    image::GrayImage::from_pixel(4, 4, Luma([255]))
        .save(root.join("plain/grey.png"))
        .unwrap();

    let pre = Preprocess::new(Preprocess::microscopy_rules());
    let ds = ImageFolder::new(root, None, pre, transform()).unwrap();
    let mut rng = Rng::new(3);

    // dp: transparent black composited on white, then grey
    let dp = ds.get(0, &mut rng).unwrap();
    assert_eq!(ds.class_names()[dp.label], "dp");
    assert!(dp.image.data().iter().all(|v| (v - 1.0).abs() < 1e-5));

    // malaria: white, greyed and inverted to black
    let malaria = ds.get(1, &mut rng).unwrap();
    assert!(malaria.image.data().iter().all(|v| (v + 1.0).abs() < 1e-5));

    // no rule: single channel replicated to three
    let plain = ds.get(2, &mut rng).unwrap();
    assert_eq!(plain.image.dims(), &[3, 4, 4]);
    assert!(plain.image.data().iter().all(|v| (v - 1.0).abs() < 1e-5));
}

#[test]
fn test_loader_over_folder_with_random_crop() {
    let dir = tempfile::tempdir().unwrap();
    for (class, n) in [("a", 3), ("b", 2)] {
        for i in 0..n {
            write_rgb(&dir.path().join(format!("{class}/{i}.png")), 10, 8, [i * 40, 0, 0]);
        }
    }
    let ds = ImageFolder::new(
        dir.path(),
        None,
        Preprocess::default(),
        Transform::train(Some(6), 4, 4, 3),
    )
    .unwrap();
    let mut loader = DataLoader::new(ds, 2, 11)
        .shuffle(true)
        .drop_last(true)
        .repeat(true);

    for _ in 0..4 {
        let batch = loader.next().unwrap().unwrap();
        assert_eq!(batch.images.dims(), &[2, 3, 4, 4]);
        assert!(batch.labels.iter().all(|&l| l < 2));
    }
    assert_eq!(loader.epoch(), 1);
}

#[test]
fn test_grid_roundtrip_through_png() {
    let dir = tempfile::tempdir().unwrap();
    write_rgb(&dir.path().join("c/0.png"), 4, 4, [255, 255, 255]);
    let ds = ImageFolder::new(dir.path(), None, Preprocess::default(), transform()).unwrap();
    let batch = DataLoader::new(ds, 1, 0).next().unwrap().unwrap();

    let out = dir.path().join("grid.png");
    save_image_grid(&[&batch.images, &batch.images], &out).unwrap();
    let img = image::open(&out).unwrap().to_rgb8();
    assert_eq!(img.dimensions(), (4, 8));
    assert!(img.pixels().all(|p| p.0 == [255, 255, 255]));
}
