use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_check as gst_check;

fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        gst::init().unwrap();
        gstgva::plugin_register_static().expect("gva plugin registration");
    });
}

fn make(factory: &str) -> gst::Element {
    gst::ElementFactory::make(factory).build().unwrap()
}

#[test]
fn video_elements_default_inference_region() {
    init();

    let detect = make("gvadetect");
    assert_eq!(
        detect.property::<gstgva::common::InferenceRegion>("inference-region"),
        gstgva::common::InferenceRegion::FullFrame
    );

    let classify = make("gvaclassify");
    assert_eq!(
        classify.property::<gstgva::common::InferenceRegion>("inference-region"),
        gstgva::common::InferenceRegion::RoiList
    );
    assert_eq!(classify.property::<u32>("reclassify-interval"), 1);
    assert!(detect.find_property("reclassify-interval").is_none());
}

#[test]
fn video_properties_round_trip() {
    init();

    let detect = make("gvadetect");
    detect.set_property("model", "/models/person.eim");
    detect.set_property("model-instance-id", "det0");
    detect.set_property("nireq", 4u32);
    detect.set_property("scheduling-policy", "latency");
    detect.set_property("threshold", 0.7f64);

    assert_eq!(detect.property::<Option<String>>("model").as_deref(), Some("/models/person.eim"));
    assert_eq!(detect.property::<Option<String>>("model-instance-id").as_deref(), Some("det0"));
    assert_eq!(detect.property::<u32>("nireq"), 4);
    assert_eq!(detect.property::<String>("scheduling-policy"), "latency");
    assert_eq!(detect.property::<f64>("threshold"), 0.7);
    assert_eq!(detect.property::<String>("device"), "CPU");
    assert_eq!(detect.property::<u32>("inference-interval"), 1);
}

#[test]
fn detect_without_model_does_not_start() {
    init();

    let detect = make("gvadetect");
    assert!(detect.set_state(gst::State::Paused).is_err());
    detect.set_state(gst::State::Null).unwrap();
}

#[test]
fn classify_rejects_object_class_on_full_frame() {
    init();

    let classify = make("gvaclassify");
    classify.set_property("model-instance-id", "cls0");
    classify.set_property("object-class", "vehicle");
    classify.set_property_from_str("inference-region", "full-frame");
    assert!(classify.set_state(gst::State::Paused).is_err());
    classify.set_state(gst::State::Null).unwrap();
}

#[test]
fn unknown_scheduling_policy_does_not_start() {
    init();

    let detect = make("gvadetect");
    detect.set_property("model-instance-id", "det-policy");
    detect.set_property("scheduling-policy", "fastest");
    assert!(detect.set_state(gst::State::Paused).is_err());
    detect.set_state(gst::State::Null).unwrap();
}

#[test]
fn audio_detect_properties() {
    init();

    let audio = make("gvaaudiodetect");
    assert_eq!(audio.property::<f32>("sliding-window"), 1.0);
    assert_eq!(audio.property::<f32>("threshold"), 0.5);

    audio.set_property("sliding-window", 0.2f32);
    assert_eq!(audio.property::<f32>("sliding-window"), 0.2);
}

#[test]
fn audio_detect_without_model_does_not_start() {
    init();

    let audio = make("gvaaudiodetect");
    assert!(audio.set_state(gst::State::Paused).is_err());
    audio.set_state(gst::State::Null).unwrap();
}

#[test]
fn shared_instance_without_master_fails_negotiation() {
    init();

    let mut h = gst_check::Harness::new("gvadetect");
    h.element()
        .unwrap()
        .set_property("model-instance-id", "orphan");
    h.play();
    h.set_src_caps_str("video/x-raw,format=RGB,width=64,height=48,framerate=30/1");

    let buffer = gst::Buffer::with_size(64 * 48 * 3).unwrap();
    assert!(h.push(buffer).is_err());
}
